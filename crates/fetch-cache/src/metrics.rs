//! Fire-and-forget counters for the retrieval path

use crate::types::{CacheStats, StoreUsage};
use std::sync::atomic::{AtomicU64, Ordering};

/// Receives cache events. Implementations must not block.
pub trait MetricsSink: Send + Sync {
    fn record_hit(&self) {}
    fn record_miss(&self) {}
    fn record_origin_fetch(&self) {}
    /// A caller waited on another caller's in-flight fetch
    fn record_coalesced(&self) {}
    fn record_bytes_served(&self, _bytes: u64) {}
    fn record_store_failure(&self) {}
    fn record_index_unavailable(&self) {}
    fn record_eviction(&self, _bytes: u64) {}
}

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {}

/// Atomic counters, readable as a [`CacheStats`] snapshot
#[derive(Debug, Default)]
pub struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    origin_fetches: AtomicU64,
    coalesced: AtomicU64,
    bytes_served: AtomicU64,
    store_failures: AtomicU64,
    index_failures: AtomicU64,
    evictions: AtomicU64,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self, usage: StoreUsage) -> CacheStats {
        CacheStats {
            entries: usage.entries,
            total_size: usage.total_size,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            origin_fetches: self.origin_fetches.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            bytes_served: self.bytes_served.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
            index_failures: self.index_failures.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

impl MetricsSink for CacheMetrics {
    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn record_origin_fetch(&self) {
        self.origin_fetches.fetch_add(1, Ordering::Relaxed);
    }

    fn record_coalesced(&self) {
        self.coalesced.fetch_add(1, Ordering::Relaxed);
    }

    fn record_bytes_served(&self, bytes: u64) {
        self.bytes_served.fetch_add(bytes, Ordering::Relaxed);
    }

    fn record_store_failure(&self) {
        self.store_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn record_index_unavailable(&self) {
        self.index_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn record_eviction(&self, _bytes: u64) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }
}
