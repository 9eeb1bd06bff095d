use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, warn};

use crate::cache::{DnsCache, DEFAULT_TTL_SECS};
use crate::local::LocalDomains;
use crate::proto::{self, MAX_DATAGRAM, QCLASS_IN, QTYPE_A, RCODE_NOTIMP, RCODE_SERVFAIL};
use crate::resolver::{Resolve, SystemResolver, UpstreamResolver};
use crate::stats::ServerStats;

/// How long a worker blocks in recv_from before rechecking the running
/// flag. This is the shutdown mechanism: workers poll the flag between
/// timed reads instead of being unblocked by a socket close.
const RECV_POLL_TIMEOUT: Duration = Duration::from_millis(250);

pub const MIN_WORKERS: usize = 4;

/// Per-datagram tier selection: precompiled table, then cache, then
/// upstream. Shared read-only across all workers once serving starts.
pub(crate) struct QueryHandler {
    local: LocalDomains,
    cache: Arc<DnsCache>,
    resolver: Box<dyn Resolve>,
    stats: Arc<ServerStats>,
}

impl QueryHandler {
    /// Returns the datagram to send back, or `None` to drop silently.
    fn handle(&self, packet: &[u8]) -> Option<Bytes> {
        let start = Instant::now();
        self.stats.total_queries.fetch_add(1, Ordering::Relaxed);

        let header = proto::parse_header(packet)?;
        if header.qdcount != 1 {
            return None;
        }
        let mut name_buf = [0u8; 256];
        let question = proto::parse_question(packet, &mut name_buf)?;
        if question.qtype != QTYPE_A || question.qclass != QCLASS_IN {
            return Some(proto::build_error(header.id, RCODE_NOTIMP));
        }

        let domain = question.qname.to_ascii_lowercase();

        if let Some(resp) = self.local.lookup(&domain, header.id) {
            self.stats.local_domain_hits.fetch_add(1, Ordering::Relaxed);
            self.stats.record_latency(start.elapsed());
            return Some(resp);
        }

        if let Some(ip) = self.cache.get(&domain) {
            self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
            let resp = proto::build_response(header.id, question.qname, ip);
            self.stats.record_latency(start.elapsed());
            return Some(resp);
        }

        let resp = match self.resolver.resolve(&domain) {
            Some(ip) => {
                self.cache
                    .set(&domain, ip, Duration::from_secs(DEFAULT_TTL_SECS));
                proto::build_response(header.id, question.qname, ip)
            }
            None => {
                debug!(event = "upstream_miss", qname = %domain, "resolution failed, answering servfail");
                proto::build_error(header.id, RCODE_SERVFAIL)
            }
        };
        self.stats.record_latency(start.elapsed());
        Some(resp)
    }
}

/// UDP listener pool over one shared socket. Local domains and upstream
/// servers are registered before `start`; the precompiled table is frozen
/// into the handler when workers spawn.
pub struct DnsServer {
    socket: Arc<UdpSocket>,
    running: Arc<AtomicBool>,
    cache: Arc<DnsCache>,
    stats: Arc<ServerStats>,
    local: LocalDomains,
    upstreams: Vec<SocketAddr>,
    upstream_timeout: Duration,
    worker_count: usize,
    workers: Vec<JoinHandle<()>>,
}

impl DnsServer {
    /// Bind the shared socket. `workers == 0` selects hardware parallelism
    /// clamped to at least [`MIN_WORKERS`].
    pub fn bind(port: u16, workers: usize, upstream_timeout: Duration) -> Result<Self> {
        let socket = create_udp_socket(port)?;
        let worker_count = if workers > 0 {
            workers
        } else {
            num_cpus::get().max(MIN_WORKERS)
        };
        Ok(Self {
            socket: Arc::new(socket),
            running: Arc::new(AtomicBool::new(false)),
            cache: Arc::new(DnsCache::new()),
            stats: Arc::new(ServerStats::default()),
            local: LocalDomains::default(),
            upstreams: Vec::new(),
            upstream_timeout,
            worker_count,
            workers: Vec::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().context("socket local addr")
    }

    pub fn cache(&self) -> Arc<DnsCache> {
        Arc::clone(&self.cache)
    }

    pub fn stats(&self) -> Arc<ServerStats> {
        Arc::clone(&self.stats)
    }

    pub fn add_local_domain(&mut self, domain: &str, ip: Ipv4Addr) {
        self.local.add(domain, ip);
    }

    pub fn add_upstream_resolver(&mut self, addr: SocketAddr) {
        self.upstreams.push(addr);
    }

    pub fn start(&mut self) -> Result<()> {
        if !self.workers.is_empty() {
            anyhow::bail!("server already started");
        }
        self.running.store(true, Ordering::SeqCst);

        let resolver: Box<dyn Resolve> = if self.upstreams.is_empty() {
            Box::new(SystemResolver)
        } else {
            Box::new(UpstreamResolver::new(
                self.upstreams.clone(),
                self.upstream_timeout,
            ))
        };
        let handler = Arc::new(QueryHandler {
            local: mem::take(&mut self.local),
            cache: Arc::clone(&self.cache),
            resolver,
            stats: Arc::clone(&self.stats),
        });
        let local_domains = handler.local.len();

        for worker_id in 0..self.worker_count {
            let socket = Arc::clone(&self.socket);
            let running = Arc::clone(&self.running);
            let handler = Arc::clone(&handler);
            let handle = thread::Builder::new()
                .name(format!("udp-worker-{worker_id}"))
                .spawn(move || worker_loop(worker_id, socket, running, handler))
                .context("spawn listener worker")?;
            self.workers.push(handle);
        }

        info!(workers = self.worker_count, local_domains, "dns server started");
        Ok(())
    }

    /// Cooperative shutdown: flip the flag and join. Workers notice within
    /// one poll timeout plus any in-flight upstream resolution.
    pub fn stop(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        self.running.store(false, Ordering::SeqCst);
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        info!("dns server stopped");
    }
}

impl Drop for DnsServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(
    worker_id: usize,
    socket: Arc<UdpSocket>,
    running: Arc<AtomicBool>,
    handler: Arc<QueryHandler>,
) {
    let mut buf = [0u8; MAX_DATAGRAM];
    while running.load(Ordering::SeqCst) {
        let (len, peer) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                continue;
            }
            Err(err) => {
                if running.load(Ordering::SeqCst) {
                    warn!(worker_id, error = %err, "recv_from failed");
                }
                continue;
            }
        };

        if let Some(resp) = handler.handle(&buf[..len]) {
            if let Err(err) = socket.send_to(&resp, peer) {
                debug!(worker_id, peer = %peer, error = %err, "send_to failed");
            }
        }
    }
}

fn create_udp_socket(port: u16) -> Result<UdpSocket> {
    let socket =
        Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).context("create udp socket")?;
    socket.set_reuse_address(true).context("set reuse_address")?;
    // Large kernel buffers so bursts survive slow workers.
    if let Err(err) = socket.set_recv_buffer_size(4 * 1024 * 1024) {
        warn!(error = %err, "failed to set udp recv buffer size");
    }
    if let Err(err) = socket.set_send_buffer_size(4 * 1024 * 1024) {
        warn!(error = %err, "failed to set udp send buffer size");
    }
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    socket
        .bind(&addr.into())
        .with_context(|| format!("bind udp socket to port {port}"))?;
    let socket: UdpSocket = socket.into();
    socket
        .set_read_timeout(Some(RECV_POLL_TIMEOUT))
        .context("set read timeout")?;
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{parse_header, FLAGS_RESPONSE, HEADER_LEN};
    use std::collections::HashMap;

    struct MapResolver(HashMap<String, Ipv4Addr>);

    impl Resolve for MapResolver {
        fn resolve(&self, domain: &str) -> Option<Ipv4Addr> {
            self.0.get(domain).copied()
        }
    }

    struct FailingResolver;

    impl Resolve for FailingResolver {
        fn resolve(&self, _domain: &str) -> Option<Ipv4Addr> {
            None
        }
    }

    fn handler_with(resolver: Box<dyn Resolve>) -> QueryHandler {
        QueryHandler {
            local: LocalDomains::default(),
            cache: Arc::new(DnsCache::new()),
            resolver,
            stats: Arc::new(ServerStats::default()),
        }
    }

    fn query_packet(id: u16, qname: &str, qtype: u16, qclass: u16) -> Vec<u8> {
        let mut packet = Vec::new();
        packet.extend_from_slice(&id.to_be_bytes());
        packet.extend_from_slice(&0x0100u16.to_be_bytes());
        packet.extend_from_slice(&1u16.to_be_bytes());
        packet.extend_from_slice(&[0; 6]);
        for label in qname.split('.') {
            packet.push(label.len() as u8);
            packet.extend_from_slice(label.as_bytes());
        }
        packet.push(0);
        packet.extend_from_slice(&qtype.to_be_bytes());
        packet.extend_from_slice(&qclass.to_be_bytes());
        packet
    }

    fn rdata(resp: &[u8]) -> &[u8] {
        &resp[resp.len() - 4..]
    }

    #[test]
    fn precompiled_tier_answers_first() {
        let mut handler = handler_with(Box::new(FailingResolver));
        handler.local.add("localhost", Ipv4Addr::new(127, 0, 0, 1));

        let resp = handler
            .handle(&query_packet(0x1234, "localhost", QTYPE_A, QCLASS_IN))
            .expect("response");
        let header = parse_header(&resp).expect("header");
        assert_eq!(header.id, 0x1234);
        assert_eq!(header.flags, FLAGS_RESPONSE);
        assert_eq!(header.qdcount, 1);
        assert_eq!(header.ancount, 1);
        assert_eq!(rdata(&resp), &[127, 0, 0, 1]);
        assert_eq!(handler.stats.local_domain_hits.load(Ordering::Relaxed), 1);
        assert_eq!(handler.stats.total_queries.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn cache_tier_answers_seeded_domains() {
        let handler = handler_with(Box::new(FailingResolver));
        handler.cache.set(
            "example.com",
            Ipv4Addr::new(93, 184, 216, 34),
            Duration::from_secs(300),
        );

        for id in [0x1111u16, 0x2222] {
            let resp = handler
                .handle(&query_packet(id, "example.com", QTYPE_A, QCLASS_IN))
                .expect("response");
            let header = parse_header(&resp).expect("header");
            assert_eq!(header.id, id);
            assert_eq!(rdata(&resp), &[0x5D, 0xB8, 0xD8, 0x22]);
        }
        assert_eq!(handler.stats.cache_hits.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn lookup_is_case_insensitive_but_echo_is_not() {
        let handler = handler_with(Box::new(FailingResolver));
        handler.cache.set(
            "example.com",
            Ipv4Addr::new(1, 2, 3, 4),
            Duration::from_secs(300),
        );

        let resp = handler
            .handle(&query_packet(5, "ExAmPlE.CoM", QTYPE_A, QCLASS_IN))
            .expect("response");
        assert_eq!(rdata(&resp), &[1, 2, 3, 4]);
        // The question section echoes the original spelling.
        let mut buf = [0u8; 256];
        let q = proto::parse_question(&resp, &mut buf).expect("question");
        assert_eq!(q.qname, "ExAmPlE.CoM");
    }

    #[test]
    fn unsupported_qtype_gets_notimp() {
        let handler = handler_with(Box::new(FailingResolver));
        let resp = handler
            .handle(&query_packet(9, "example.com", 28, QCLASS_IN))
            .expect("response");
        let header = parse_header(&resp).expect("header");
        assert_eq!(header.id, 9);
        assert_eq!(header.flags & 0x000F, RCODE_NOTIMP);
        assert_eq!(header.ancount, 0);
        assert_eq!(resp.len(), HEADER_LEN);
    }

    #[test]
    fn upstream_failure_gets_servfail() {
        let handler = handler_with(Box::new(FailingResolver));
        let resp = handler
            .handle(&query_packet(7, "unresolvable.test", QTYPE_A, QCLASS_IN))
            .expect("response");
        let header = parse_header(&resp).expect("header");
        assert_eq!(header.id, 7);
        assert_eq!(header.flags & 0x000F, RCODE_SERVFAIL);
        assert_eq!(header.ancount, 0);
    }

    #[test]
    fn upstream_success_populates_the_cache() {
        let mut table = HashMap::new();
        table.insert("fresh.test".to_string(), Ipv4Addr::new(10, 1, 2, 3));
        let handler = handler_with(Box::new(MapResolver(table)));

        let resp = handler
            .handle(&query_packet(1, "fresh.test", QTYPE_A, QCLASS_IN))
            .expect("response");
        assert_eq!(rdata(&resp), &[10, 1, 2, 3]);
        assert_eq!(handler.cache.get("fresh.test"), Some(Ipv4Addr::new(10, 1, 2, 3)));

        // Second query is served from the cache tier.
        handler
            .handle(&query_packet(2, "fresh.test", QTYPE_A, QCLASS_IN))
            .expect("response");
        assert_eq!(handler.stats.cache_hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn malformed_datagrams_are_dropped_silently() {
        let handler = handler_with(Box::new(FailingResolver));
        assert!(handler.handle(&[0u8; 4]).is_none());

        // qdcount = 2
        let mut packet = query_packet(1, "example.com", QTYPE_A, QCLASS_IN);
        packet[5] = 2;
        assert!(handler.handle(&packet).is_none());

        // reserved label length octet
        let mut packet = query_packet(1, "example.com", QTYPE_A, QCLASS_IN);
        packet[HEADER_LEN] = 0x41;
        assert!(handler.handle(&packet).is_none());

        // Every drop still counted as a query, and nothing was sent.
        assert_eq!(handler.stats.total_queries.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn server_answers_over_a_real_socket() {
        let mut server =
            DnsServer::bind(0, 2, Duration::from_millis(100)).expect("bind server");
        server.add_local_domain("localhost", Ipv4Addr::new(127, 0, 0, 1));
        server.start().expect("start server");
        let port = server.local_addr().expect("local addr").port();

        let client = UdpSocket::bind("127.0.0.1:0").expect("bind client");
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .expect("client timeout");

        // Precompiled fast path.
        client
            .send_to(
                &query_packet(0x1234, "localhost", QTYPE_A, QCLASS_IN),
                ("127.0.0.1", port),
            )
            .expect("send query");
        let mut buf = [0u8; 512];
        let (len, _) = client.recv_from(&mut buf).expect("recv response");
        let header = parse_header(&buf[..len]).expect("header");
        assert_eq!(header.id, 0x1234);
        assert_eq!(header.ancount, 1);
        assert_eq!(&buf[len - 4..len], &[127, 0, 0, 1]);

        // AAAA is not implemented.
        client
            .send_to(
                &query_packet(0x4444, "localhost", 28, QCLASS_IN),
                ("127.0.0.1", port),
            )
            .expect("send query");
        let (len, _) = client.recv_from(&mut buf).expect("recv response");
        let header = parse_header(&buf[..len]).expect("header");
        assert_eq!(header.flags & 0x000F, RCODE_NOTIMP);

        server.stop();
    }
}
