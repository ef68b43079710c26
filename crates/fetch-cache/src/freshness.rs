//! Freshness index: cache key -> last successful refresh

use crate::error::IndexError;
use crate::types::CacheKey;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use tokio::sync::RwLock;

/// Shared record of when each entry was last refreshed.
///
/// `mark_refreshed` must only be called once the blob store holds the complete
/// payload for `key`.
#[async_trait]
pub trait FreshnessIndex: Send + Sync {
    async fn last_refreshed(&self, key: &CacheKey) -> Result<Option<DateTime<Utc>>, IndexError>;

    async fn mark_refreshed(&self, key: &CacheKey, at: DateTime<Utc>) -> Result<(), IndexError>;

    /// Removing an absent key is a no-op
    async fn remove(&self, key: &CacheKey) -> Result<(), IndexError>;
}

/// Whether an entry refreshed at `refreshed_at` may still be served at `now`
pub(crate) fn is_fresh(
    refreshed_at: DateTime<Utc>,
    now: DateTime<Utc>,
    max_age: std::time::Duration,
) -> bool {
    let max_age = Duration::from_std(max_age).unwrap_or(Duration::MAX);
    now.signed_duration_since(refreshed_at) <= max_age
}

/// Process-local index, for single-instance deployments and tests
#[derive(Debug, Default)]
pub struct MemoryFreshnessIndex {
    entries: RwLock<BTreeMap<CacheKey, DateTime<Utc>>>,
}

impl MemoryFreshnessIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl FreshnessIndex for MemoryFreshnessIndex {
    async fn last_refreshed(&self, key: &CacheKey) -> Result<Option<DateTime<Utc>>, IndexError> {
        Ok(self.entries.read().await.get(key).copied())
    }

    async fn mark_refreshed(&self, key: &CacheKey, at: DateTime<Utc>) -> Result<(), IndexError> {
        self.entries.write().await.insert(key.clone(), at);
        Ok(())
    }

    async fn remove(&self, key: &CacheKey) -> Result<(), IndexError> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}
