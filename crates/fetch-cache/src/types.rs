//! Cache types

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;

/// Payload bytes as they arrive from disk or from the origin
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// Length of a hex-encoded SHA-256 digest
pub(crate) const KEY_LEN: usize = 64;

/// Fixed-length key derived from a resource identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    pub(crate) fn from_digest(hex: String) -> Self {
        Self(hex)
    }

    /// Parse a key previously produced by [`crate::fingerprint`]
    pub fn from_hex(s: &str) -> Option<Self> {
        let valid = s.len() == KEY_LEN
            && s
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        valid.then(|| Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Content type and length reported to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceMetadata {
    pub content_type: String,
    /// Unknown only for live origin streams sent without a Content-Length
    pub content_length: Option<u64>,
}

/// Where a [`Resource`] was served from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CacheSource {
    Store,
    Origin,
}

impl CacheSource {
    pub fn is_hit(self) -> bool {
        matches!(self, CacheSource::Store)
    }
}

/// A resource handed back by [`crate::FetchCache::retrieve`]
pub struct Resource {
    pub metadata: ResourceMetadata,
    pub body: ByteStream,
    pub source: CacheSource,
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("metadata", &self.metadata)
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

/// A committed blob store entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    pub key: CacheKey,
    pub content_type: String,
    pub size: u64,
    pub stored_at: DateTime<Utc>,
}

/// Retained entries and bytes on disk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreUsage {
    pub entries: usize,
    pub total_size: u64,
}

/// Statistics about the cache
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub total_size: u64,
    pub hits: u64,
    pub misses: u64,
    pub origin_fetches: u64,
    pub coalesced: u64,
    pub bytes_served: u64,
    pub store_failures: u64,
    pub index_failures: u64,
    pub evictions: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_stats_default() {
        let stats = CacheStats::default();
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.total_size, 0);
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 0);
    }

    #[test]
    fn test_cache_key_from_hex() {
        let hex = "a".repeat(KEY_LEN);
        let key = CacheKey::from_hex(&hex).unwrap();
        assert_eq!(key.as_str(), hex);
        assert_eq!(key.to_string(), hex);

        assert!(CacheKey::from_hex("abc").is_none());
        assert!(CacheKey::from_hex(&"A".repeat(KEY_LEN)).is_none());
        assert!(CacheKey::from_hex(&"g".repeat(KEY_LEN)).is_none());
    }

    #[test]
    fn test_resource_metadata_serialization() {
        let meta = ResourceMetadata {
            content_type: "image/jpeg".to_string(),
            content_length: Some(12345),
        };

        let json = serde_json::to_string(&meta).unwrap();
        assert!(json.contains("\"contentType\":\"image/jpeg\""));
        assert!(json.contains("\"contentLength\":12345"));

        let deserialized: ResourceMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, meta);
    }

    #[test]
    fn test_cache_source_is_hit() {
        assert!(CacheSource::Store.is_hit());
        assert!(!CacheSource::Origin.is_hit());
    }
}
