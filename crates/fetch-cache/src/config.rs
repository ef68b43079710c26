use std::path::PathBuf;
use std::time::Duration;

/// Construction-time settings for a [`crate::FetchCache`]
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Namespace for freshness records, so several caches can share one index
    pub name: String,
    pub cache_dir: PathBuf,
    /// Max age used by `retrieve` when the caller does not pass one
    pub default_max_age: Duration,
    pub origin_timeout: Duration,
    /// Retention budget in bytes
    pub max_cache_size: u64,
    /// Retention budget in entries
    pub max_entries: usize,
    /// Bytes a caller may fall behind the origin before its live body is cut off
    pub caller_buffer_size: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            name: "cache".to_string(),
            cache_dir: PathBuf::from("./cache/blobs"),
            default_max_age: Duration::from_secs(24 * 60 * 60), // 24 hours
            origin_timeout: Duration::from_secs(30),
            max_cache_size: 1024 * 1024 * 1024, // 1GB
            max_entries: 100_000,
            caller_buffer_size: 16 * 1024 * 1024, // 16MB
        }
    }
}
