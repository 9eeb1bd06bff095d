use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::str::FromStr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use anyhow::Context;
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use tracing::{debug, warn};

/// Upstream resolution seam. Implementations block the calling worker;
/// the dispatcher only learns success or failure.
pub trait Resolve: Send + Sync {
    fn resolve(&self, domain: &str) -> Option<Ipv4Addr>;
}

/// Host resolver (getaddrinfo), IPv4 only. Used when no upstream servers
/// are configured.
pub struct SystemResolver;

impl Resolve for SystemResolver {
    fn resolve(&self, domain: &str) -> Option<Ipv4Addr> {
        let addrs = (domain, 0u16).to_socket_addrs().ok()?;
        for addr in addrs {
            if let SocketAddr::V4(v4) = addr {
                return Some(*v4.ip());
            }
        }
        None
    }
}

/// Stub UDP client that asks each configured upstream in order and takes
/// the first A answer. One fresh socket per attempt keeps transaction ids
/// trivially unambiguous.
pub struct UpstreamResolver {
    servers: Vec<SocketAddr>,
    timeout: Duration,
    next_id: AtomicU16,
}

impl UpstreamResolver {
    pub fn new(servers: Vec<SocketAddr>, timeout: Duration) -> Self {
        Self {
            servers,
            timeout,
            next_id: AtomicU16::new(1),
        }
    }

    fn query_one(
        &self,
        server: SocketAddr,
        packet: &[u8],
        tx_id: u16,
    ) -> anyhow::Result<Option<Ipv4Addr>> {
        let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
            .context("bind upstream socket")?;
        socket
            .set_read_timeout(Some(self.timeout))
            .context("set upstream read timeout")?;
        socket.connect(server).context("connect upstream")?;
        socket.send(packet).context("send upstream query")?;

        let mut buf = [0u8; 4096];
        loop {
            let len = socket.recv(&mut buf).context("recv upstream response")?;
            // Discard strays; the timeout bounds how long we keep reading.
            if len >= 2 && buf[..2] == tx_id.to_be_bytes() {
                let msg = Message::from_vec(&buf[..len]).context("parse upstream response")?;
                for record in msg.answers() {
                    if let RData::A(a) = record.data() {
                        return Ok(Some(a.0));
                    }
                }
                return Ok(None);
            }
        }
    }
}

impl Resolve for UpstreamResolver {
    fn resolve(&self, domain: &str) -> Option<Ipv4Addr> {
        let tx_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let packet = match build_a_query(tx_id, domain) {
            Ok(packet) => packet,
            Err(err) => {
                debug!(qname = %domain, error = %err, "failed to build upstream query");
                return None;
            }
        };

        for server in &self.servers {
            match self.query_one(*server, &packet, tx_id) {
                Ok(Some(ip)) => {
                    debug!(qname = %domain, upstream = %server, ip = %ip, "upstream answer");
                    return Some(ip);
                }
                Ok(None) => {
                    debug!(qname = %domain, upstream = %server, "upstream had no A answer");
                }
                Err(err) => {
                    warn!(
                        event = "upstream_failover",
                        qname = %domain,
                        upstream = %server,
                        error = %err,
                        "upstream attempt failed"
                    );
                }
            }
        }
        None
    }
}

fn build_a_query(tx_id: u16, domain: &str) -> anyhow::Result<Vec<u8>> {
    let mut msg = Message::new();
    msg.set_id(tx_id);
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(true);
    msg.add_query(Query::query(
        Name::from_str(domain).context("invalid query name")?,
        RecordType::A,
    ));
    msg.to_vec().context("encode upstream query")
}
