//! Cache counters. Mutated with relaxed atomics on the hot paths;
//! snapshots are lock-free and serializable for diagnostic dumps.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub recent_hits: AtomicU64,
    pub frequent_hits: AtomicU64,
    pub recent_ghost_hits: AtomicU64,
    pub frequent_ghost_hits: AtomicU64,
    pub in_flight_joins: AtomicU64,
    pub evictions: AtomicU64,
    pub recycles: AtomicU64,
    pub ghost_evictions: AtomicU64,
    pub fetch_failures: AtomicU64,
    pub shrinks: AtomicU64,
    pub grows: AtomicU64,
}

#[derive(Debug, Default)]
pub struct SecondaryCacheStats {
    pub feed_cycles: AtomicU64,
    pub writes: AtomicU64,
    pub write_bytes: AtomicU64,
    pub compressed_writes: AtomicU64,
    pub zero_payloads: AtomicU64,
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub checksum_failures: AtomicU64,
    pub fallback_reads: AtomicU64,
    pub evicted_shadows: AtomicU64,
    pub write_errors: AtomicU64,
}

/// Point-in-time view of [`CacheStats`] plus the sizing targets.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub recent_hits: u64,
    pub frequent_hits: u64,
    pub recent_ghost_hits: u64,
    pub frequent_ghost_hits: u64,
    pub in_flight_joins: u64,
    pub evictions: u64,
    pub recycles: u64,
    pub ghost_evictions: u64,
    pub fetch_failures: u64,
    pub shrinks: u64,
    pub grows: u64,
    pub target: u64,
    pub recent_target: u64,
    pub anon_bytes: u64,
    pub recent_bytes: u64,
    pub frequent_bytes: u64,
    pub recent_ghost_bytes: u64,
    pub frequent_ghost_bytes: u64,
    pub secondary_only_bytes: u64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SecondaryCacheStatsSnapshot {
    pub feed_cycles: u64,
    pub writes: u64,
    pub write_bytes: u64,
    pub compressed_writes: u64,
    pub zero_payloads: u64,
    pub hits: u64,
    pub misses: u64,
    pub checksum_failures: u64,
    pub fallback_reads: u64,
    pub evicted_shadows: u64,
    pub write_errors: u64,
}

impl SecondaryCacheStats {
    pub(crate) fn snapshot(&self) -> SecondaryCacheStatsSnapshot {
        SecondaryCacheStatsSnapshot {
            feed_cycles: self.feed_cycles.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            write_bytes: self.write_bytes.load(Ordering::Relaxed),
            compressed_writes: self.compressed_writes.load(Ordering::Relaxed),
            zero_payloads: self.zero_payloads.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            checksum_failures: self.checksum_failures.load(Ordering::Relaxed),
            fallback_reads: self.fallback_reads.load(Ordering::Relaxed),
            evicted_shadows: self.evicted_shadows.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
        }
    }
}
