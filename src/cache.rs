use std::hash::{Hash, Hasher};
use std::net::Ipv4Addr;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use rustc_hash::FxHasher;

/// Shard count must stay a power of two so selection is a mask.
pub const NUM_SHARDS: usize = 16;
pub const SHARD_CAPACITY: usize = 512;

/// TTL applied to upstream results regardless of the upstream-reported TTL.
pub const DEFAULT_TTL_SECS: u64 = 300;

#[derive(Debug, Clone)]
struct CacheEntry {
    ip: Ipv4Addr,
    expires_at: Instant,
    /// Advisory per-entry counter, only ever touched under the shard lock.
    #[allow(dead_code)]
    hits: u64,
}

impl CacheEntry {
    fn is_valid(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

struct Shard {
    entries: Mutex<LruCache<String, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl Shard {
    fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Drop every entry whose expiry is at or before `now`. Runs under the
    /// shard lock on every get and set; an expired entry never survives to
    /// satisfy a lookup.
    fn reap(entries: &mut LruCache<String, CacheEntry>, now: Instant) {
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| !entry.is_valid(now))
            .map(|(domain, _)| domain.clone())
            .collect();
        for domain in expired {
            entries.pop(&domain);
        }
    }
}

/// Aggregated counters across all shards. Loads are relaxed; the numbers
/// are a snapshot, not a consistent cut.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: usize,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups > 0 {
            self.hits as f64 / lookups as f64
        } else {
            0.0
        }
    }
}

/// Sharded resolution cache with combined TTL expiry and per-shard LRU
/// capacity bounds. TTL and LRU are independent: the LRU tail may still be
/// valid when capacity forces it out.
pub struct DnsCache {
    shards: Vec<Shard>,
    shard_capacity: usize,
}

impl Default for DnsCache {
    fn default() -> Self {
        Self::new()
    }
}

impl DnsCache {
    pub fn new() -> Self {
        Self::with_shard_capacity(SHARD_CAPACITY)
    }

    pub fn with_shard_capacity(shard_capacity: usize) -> Self {
        Self {
            shards: (0..NUM_SHARDS).map(|_| Shard::new(shard_capacity)).collect(),
            shard_capacity,
        }
    }

    /// Stable within a run; cross-run stability is not promised.
    pub(crate) fn shard_index(domain: &str) -> usize {
        let mut hasher = FxHasher::default();
        domain.hash(&mut hasher);
        hasher.finish() as usize & (NUM_SHARDS - 1)
    }

    pub fn get(&self, domain: &str) -> Option<Ipv4Addr> {
        let shard = &self.shards[Self::shard_index(domain)];
        let now = Instant::now();
        let mut entries = shard.entries.lock();
        Shard::reap(&mut entries, now);

        // Reaping already removed anything expired at `now`, so a surviving
        // entry is valid by construction. get_mut refreshes recency.
        if let Some(entry) = entries.get_mut(domain) {
            entry.hits += 1;
            let ip = entry.ip;
            shard.hits.fetch_add(1, Ordering::Relaxed);
            return Some(ip);
        }

        shard.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn set(&self, domain: &str, ip: Ipv4Addr, ttl: Duration) {
        let shard = &self.shards[Self::shard_index(domain)];
        let now = Instant::now();
        let mut entries = shard.entries.lock();
        Shard::reap(&mut entries, now);

        if entries.len() >= self.shard_capacity && entries.pop_lru().is_some() {
            shard.evictions.fetch_add(1, Ordering::Relaxed);
        }

        entries.put(
            domain.to_string(),
            CacheEntry {
                ip,
                expires_at: now + ttl,
                hits: 0,
            },
        );
    }

    /// Reap expired entries in every shard.
    pub fn sweep(&self) {
        let now = Instant::now();
        for shard in &self.shards {
            let mut entries = shard.entries.lock();
            Shard::reap(&mut entries, now);
        }
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats::default();
        for shard in &self.shards {
            stats.hits += shard.hits.load(Ordering::Relaxed);
            stats.misses += shard.misses.load(Ordering::Relaxed);
            stats.evictions += shard.evictions.load(Ordering::Relaxed);
            stats.size += shard.entries.lock().len();
        }
        stats
    }

    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.entries.lock().len()).sum()
    }
}
