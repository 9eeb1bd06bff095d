use std::net::Ipv4Addr;
use std::str::from_utf8;

use bytes::{BufMut, Bytes, BytesMut};

pub const HEADER_LEN: usize = 12;
/// Classical DNS caps UDP messages at 512 octets.
pub const MAX_DATAGRAM: usize = 512;

pub const QTYPE_A: u16 = 1;
pub const QCLASS_IN: u16 = 1;

/// Standard response: QR, RD, RA set, no error. Error responses OR the
/// rcode into the low nibble.
pub const FLAGS_RESPONSE: u16 = 0x8180;
pub const RCODE_SERVFAIL: u16 = 2;
pub const RCODE_NOTIMP: u16 = 4;

/// Fixed TTL carried in every answer we emit.
pub const ANSWER_TTL: u32 = 300;

/// Upper bound on compression indirections per name.
const MAX_POINTER_JUMPS: usize = 10;

/// Fixed 12-octet message header. All fields are big-endian on the wire;
/// every read goes through an explicit byte-pair conversion.
#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub id: u16,
    pub flags: u16,
    pub qdcount: u16,
    pub ancount: u16,
    pub nscount: u16,
    pub arcount: u16,
}

pub fn parse_header(packet: &[u8]) -> Option<Header> {
    if packet.len() < HEADER_LEN {
        return None;
    }
    Some(Header {
        id: u16::from_be_bytes([packet[0], packet[1]]),
        flags: u16::from_be_bytes([packet[2], packet[3]]),
        qdcount: u16::from_be_bytes([packet[4], packet[5]]),
        ancount: u16::from_be_bytes([packet[6], packet[7]]),
        nscount: u16::from_be_bytes([packet[8], packet[9]]),
        arcount: u16::from_be_bytes([packet[10], packet[11]]),
    })
}

/// The single question of a query. `qname` borrows the caller's buffer and
/// preserves the case it arrived with; callers canonicalize before lookups.
pub struct Question<'a> {
    pub qname: &'a str,
    pub qtype: u16,
    pub qclass: u16,
}

/// Parse the question section that follows the header.
///
/// `buf` receives the dotted name; 256 bytes fits any legal name. Returns
/// `None` on anything malformed: a reserved length octet (0x40-0xBF), a
/// label or pointer running past the datagram, a pointer that does not
/// jump strictly backward, or a truncated qtype/qclass.
pub fn parse_question<'a>(packet: &[u8], buf: &'a mut [u8]) -> Option<Question<'a>> {
    // `pos` is where reading resumes after the name: frozen at the first
    // pointer taken, otherwise advanced past the terminator.
    let mut pos = HEADER_LEN;
    let mut cursor = HEADER_LEN;
    let mut jumped = false;
    let mut jumps = 0;
    let mut buf_len = 0;

    loop {
        let len = *packet.get(cursor)? as usize;

        if len == 0 {
            if !jumped {
                pos = cursor + 1;
            }
            break;
        }

        match len & 0xC0 {
            0x00 => {
                let start = cursor + 1;
                let label = packet.get(start..start + len)?;
                if buf_len > 0 {
                    *buf.get_mut(buf_len)? = b'.';
                    buf_len += 1;
                }
                buf.get_mut(buf_len..buf_len + len)?.copy_from_slice(label);
                buf_len += len;
                cursor = start + len;
            }
            0xC0 => {
                let lo = *packet.get(cursor + 1)? as usize;
                let target = ((len & 0x3F) << 8) | lo;
                // Forward or self-referencing targets are rejected outright;
                // the jump limit additionally bounds pathological chains.
                if target >= cursor {
                    return None;
                }
                jumps += 1;
                if jumps > MAX_POINTER_JUMPS {
                    return None;
                }
                if !jumped {
                    pos = cursor + 2;
                    jumped = true;
                }
                cursor = target;
            }
            // 0x40 and 0x80 prefixes are reserved by RFC 1035.
            _ => return None,
        }
    }

    if buf_len == 0 {
        return None;
    }
    let qname = from_utf8(&buf[..buf_len]).ok()?;

    let rest = packet.get(pos..pos + 4)?;
    Some(Question {
        qname,
        qtype: u16::from_be_bytes([rest[0], rest[1]]),
        qclass: u16::from_be_bytes([rest[2], rest[3]]),
    })
}

/// Build a positive A-record response: echoed question, then one answer
/// whose name is a compression pointer back to offset 12.
pub fn build_response(id: u16, qname: &str, ip: Ipv4Addr) -> Bytes {
    let mut out = BytesMut::with_capacity(HEADER_LEN + qname.len() + 22);
    out.put_u16(id);
    out.put_u16(FLAGS_RESPONSE);
    out.put_u16(1); // qdcount
    out.put_u16(1); // ancount
    out.put_u16(0); // nscount
    out.put_u16(0); // arcount

    encode_name(qname, &mut out);
    out.put_u16(QTYPE_A);
    out.put_u16(QCLASS_IN);

    out.put_u16(0xC000 | HEADER_LEN as u16);
    out.put_u16(QTYPE_A);
    out.put_u16(QCLASS_IN);
    out.put_u32(ANSWER_TTL);
    out.put_u16(4); // rdlength
    out.put_slice(&ip.octets());

    out.freeze()
}

/// Header-only error response with zeroed section counts.
pub fn build_error(id: u16, rcode: u16) -> Bytes {
    let mut out = BytesMut::with_capacity(HEADER_LEN);
    out.put_u16(id);
    out.put_u16(FLAGS_RESPONSE | rcode);
    out.put_u16(0);
    out.put_u16(0);
    out.put_u16(0);
    out.put_u16(0);
    out.freeze()
}

fn encode_name(qname: &str, out: &mut BytesMut) {
    for label in qname.split('.') {
        if label.is_empty() {
            continue;
        }
        out.put_u8(label.len() as u8);
        out.put_slice(label.as_bytes());
    }
    out.put_u8(0);
}
