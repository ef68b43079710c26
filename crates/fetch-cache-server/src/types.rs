//! Response bodies and request counters for the cache server

use fetch_cache::CacheStats;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

const GB: f64 = (1u64 << 30) as f64;
/// Most requested identifiers listed in /stats
pub const TOP_SERVE_URLS: usize = 10;
/// Distinct identifiers counted before new ones are ignored
const MAX_TRACKED_URLS: usize = 100_000;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub cache: CacheStats,
}

/// Traffic totals for the served and proxied routes
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub cdn_hits: u64,
    pub cdn_data: String,
    pub proxy_hits: u64,
    pub proxy_data: String,
    /// Most served identifiers, busiest first
    pub serve_urls: Vec<UrlHits>,
    pub cache: CacheStats,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UrlHits {
    pub url: String,
    pub hits: u64,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Per-route request and byte counters
#[derive(Debug, Default)]
pub struct RequestCounters {
    serve_hits: AtomicU64,
    serve_bytes: AtomicU64,
    proxy_hits: AtomicU64,
    proxy_bytes: AtomicU64,
    serve_urls: Mutex<HashMap<String, u64>>,
}

impl RequestCounters {
    /// Count a /serve request, overall and for its identifier
    pub fn record_serve(&self, identifier: &str) {
        self.serve_hits.fetch_add(1, Ordering::Relaxed);

        let mut urls = self.urls();
        if let Some(hits) = urls.get_mut(identifier) {
            *hits += 1;
        } else if urls.len() < MAX_TRACKED_URLS {
            urls.insert(identifier.to_string(), 1);
        }
    }

    pub fn record_serve_bytes(&self, bytes: u64) {
        self.serve_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_proxy(&self) {
        self.proxy_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_proxy_bytes(&self, bytes: u64) {
        self.proxy_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// The `n` most served identifiers; ties are ordered by identifier
    pub fn top_urls(&self, n: usize) -> Vec<UrlHits> {
        let mut top: Vec<UrlHits> = self
            .urls()
            .iter()
            .map(|(url, hits)| UrlHits {
                url: url.clone(),
                hits: *hits,
            })
            .collect();
        top.sort_by(|a, b| b.hits.cmp(&a.hits).then_with(|| a.url.cmp(&b.url)));
        top.truncate(n);
        top
    }

    pub fn stats(&self, cache: CacheStats) -> StatsResponse {
        StatsResponse {
            cdn_hits: self.serve_hits.load(Ordering::Relaxed),
            cdn_data: format_gb(self.serve_bytes.load(Ordering::Relaxed)),
            proxy_hits: self.proxy_hits.load(Ordering::Relaxed),
            proxy_data: format_gb(self.proxy_bytes.load(Ordering::Relaxed)),
            serve_urls: self.top_urls(TOP_SERVE_URLS),
            cache,
        }
    }

    fn urls(&self) -> MutexGuard<'_, HashMap<String, u64>> {
        self.serve_urls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Render a byte count as gigabytes with two decimals, e.g. "1.50 GB"
pub fn format_gb(bytes: u64) -> String {
    format!("{:.2} GB", bytes as f64 / GB)
}
