use std::net::Ipv4Addr;

use bytes::Bytes;
use rustc_hash::FxHashMap;

use crate::proto;

/// Pre-serialized responses for locally-authoritative names.
///
/// Each blob is a complete wire-format response whose first two octets are
/// a transaction-id placeholder; `lookup` patches them with the query id.
/// The table is populated before the listener pool starts and is read-only
/// while serving, so no synchronization is needed.
#[derive(Debug, Default)]
pub struct LocalDomains {
    responses: FxHashMap<String, Bytes>,
}

impl LocalDomains {
    /// Build and store the response for `domain`. Overwrites are
    /// idempotent: adding the same mapping twice leaves one entry.
    pub fn add(&mut self, domain: &str, ip: Ipv4Addr) {
        let domain = domain.to_ascii_lowercase();
        let blob = proto::build_response(0, &domain, ip);
        self.responses.insert(domain, blob);
    }

    /// Clone the stored blob with the transaction id patched in. `domain`
    /// must already be lowercased.
    pub fn lookup(&self, domain: &str, query_id: u16) -> Option<Bytes> {
        let blob = self.responses.get(domain)?;
        let mut out = blob.to_vec();
        out[..2].copy_from_slice(&query_id.to_be_bytes());
        Some(Bytes::from(out))
    }

    pub fn len(&self) -> usize {
        self.responses.len()
    }
}
