use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::cache::CacheStats;

/// Bounded window of recent response times, in samples.
pub const LATENCY_WINDOW: usize = 10_000;

/// Global query counters plus a sliding window of response times.
///
/// Counters are relaxed atomics updated inline on the serving path; the
/// window is a fixed-capacity ring buffer behind its own lock, so inserts
/// are O(1) and only `percentile_stats` pays for a sort.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub total_queries: AtomicU64,
    pub cache_hits: AtomicU64,
    pub local_domain_hits: AtomicU64,
    window: Mutex<LatencyWindow>,
}

#[derive(Debug, Default)]
struct LatencyWindow {
    samples: Vec<f64>,
    cursor: usize,
}

/// Snapshot derived from the counters and the latency window.
#[derive(Debug, Clone, Copy, Default)]
pub struct PerformanceStats {
    pub total_queries: u64,
    pub cache_hits: u64,
    pub local_domain_hits: u64,
    pub hit_ratio: f64,
    pub mean_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

impl ServerStats {
    pub fn record_latency(&self, elapsed: Duration) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        let mut window = self.window.lock();
        if window.samples.len() < LATENCY_WINDOW {
            window.samples.push(ms);
        } else {
            let cursor = window.cursor;
            window.samples[cursor] = ms;
        }
        window.cursor = (window.cursor + 1) % LATENCY_WINDOW;
    }

    pub fn percentile_stats(&self) -> PerformanceStats {
        let total_queries = self.total_queries.load(Ordering::Relaxed);
        let cache_hits = self.cache_hits.load(Ordering::Relaxed);
        let local_domain_hits = self.local_domain_hits.load(Ordering::Relaxed);

        let mut stats = PerformanceStats {
            total_queries,
            cache_hits,
            local_domain_hits,
            ..Default::default()
        };
        if total_queries > 0 {
            stats.hit_ratio = (cache_hits + local_domain_hits) as f64 / total_queries as f64;
        }

        let mut sorted = self.window.lock().samples.clone();
        if sorted.is_empty() {
            return stats;
        }
        sorted.sort_by(|a, b| a.total_cmp(b));

        stats.mean_ms = sorted.iter().sum::<f64>() / sorted.len() as f64;
        let p95 = (sorted.len() as f64 * 0.95) as usize;
        let p99 = (sorted.len() as f64 * 0.99) as usize;
        stats.p95_ms = sorted[p95.min(sorted.len() - 1)];
        stats.p99_ms = sorted[p99.min(sorted.len() - 1)];
        stats
    }
}

/// The periodic report block printed by the stats loop.
pub fn render_report(perf: &PerformanceStats, cache: &CacheStats) -> String {
    format!(
        "=== DNS Server Performance Stats ===\n\
         Total queries: {}\n\
         Cache hits: {}\n\
         Local domain hits: {}\n\
         Hit ratio: {:.1}%\n\
         Cache size: {} ({} hits / {} misses / {} evictions, {:.1}% hit ratio)\n\
         Average response time: {:.3}ms\n\
         95th percentile: {:.3}ms\n\
         99th percentile: {:.3}ms\n\
         ====================================",
        perf.total_queries,
        perf.cache_hits,
        perf.local_domain_hits,
        perf.hit_ratio * 100.0,
        cache.size,
        cache.hits,
        cache.misses,
        cache.evictions,
        cache.hit_ratio() * 100.0,
        perf.mean_ms,
        perf.p95_ms,
        perf.p99_ms,
    )
}
