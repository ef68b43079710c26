//! Fetch-through blob cache
//!
//! Answers "give me this resource" either from a file-backed blob store or by
//! fetching it from the origin. A fresh fetch is streamed to the caller and
//! written to disk at the same time; the freshness index is only updated once
//! the write is durable. Concurrent misses for the same resource share a single
//! origin fetch, and a size-bounded LRU keeps the store from growing forever.

mod cache;
mod clock;
mod config;
mod error;
mod fingerprint;
mod flight;
mod freshness;
mod metrics;
mod origin;
mod retention;
mod store;
mod types;

pub use cache::FetchCache;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CacheConfig;
pub use error::{CacheError, IndexError, OriginError, Result, StoreError};
pub use fingerprint::fingerprint;
pub use freshness::{FreshnessIndex, MemoryFreshnessIndex};
pub use metrics::{CacheMetrics, MetricsSink, NoopMetrics};
pub use origin::{HttpOriginFetcher, OriginFetcher, OriginResponse};
pub use retention::Retention;
pub use store::{BlobStore, BlobWriter, StoredBlob};
pub use types::{
    ByteStream, CacheKey, CacheSource, CacheStats, Resource, ResourceMetadata, StoreUsage,
    StoredEntry,
};
