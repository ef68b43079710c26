//! Postgres-backed freshness index
//!
//! Rows live in `cache_freshness`, scoped by cache name so several caches can
//! share one database.

pub mod freshness;
pub mod migrate;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fetch_cache::{CacheKey, FreshnessIndex, IndexError};
use tracing::warn;

pub use sqlx::postgres::PgPool;

/// Freshness index stored in Postgres
#[derive(Debug, Clone)]
pub struct PgFreshnessIndex {
    pool: PgPool,
    cache_name: String,
}

impl PgFreshnessIndex {
    pub fn new(pool: PgPool, cache_name: impl Into<String>) -> Self {
        Self {
            pool,
            cache_name: cache_name.into(),
        }
    }
}

#[async_trait]
impl FreshnessIndex for PgFreshnessIndex {
    async fn last_refreshed(&self, key: &CacheKey) -> Result<Option<DateTime<Utc>>, IndexError> {
        freshness::get(&self.pool, &self.cache_name, key.as_str())
            .await
            .map_err(unavailable)
    }

    async fn mark_refreshed(&self, key: &CacheKey, at: DateTime<Utc>) -> Result<(), IndexError> {
        freshness::upsert(&self.pool, &self.cache_name, key.as_str(), at)
            .await
            .map_err(unavailable)
    }

    async fn remove(&self, key: &CacheKey) -> Result<(), IndexError> {
        freshness::delete(&self.pool, &self.cache_name, key.as_str())
            .await
            .map_err(unavailable)
    }
}

fn unavailable(err: sqlx::Error) -> IndexError {
    warn!(error = %err, "Freshness query failed");
    IndexError::Unavailable(err.to_string())
}
