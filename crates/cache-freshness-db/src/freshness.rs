use chrono::{DateTime, Utc};
use sqlx::PgPool;

/// Record `key` as refreshed at `at`, replacing any earlier timestamp
pub async fn upsert(
    pool: &PgPool,
    cache_name: &str,
    key: &str,
    at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO cache_freshness (cache_name, cache_key, refreshed_at)
        VALUES ($1, $2, $3)
        ON CONFLICT (cache_name, cache_key) DO UPDATE SET refreshed_at = EXCLUDED.refreshed_at
        "#,
    )
    .bind(cache_name)
    .bind(key)
    .bind(at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Get when `key` was last refreshed
pub async fn get(
    pool: &PgPool,
    cache_name: &str,
    key: &str,
) -> Result<Option<DateTime<Utc>>, sqlx::Error> {
    let row: Option<(DateTime<Utc>,)> = sqlx::query_as(
        "SELECT refreshed_at FROM cache_freshness WHERE cache_name = $1 AND cache_key = $2",
    )
    .bind(cache_name)
    .bind(key)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|r| r.0))
}

/// Delete the record for `key` (no-op if absent)
pub async fn delete(pool: &PgPool, cache_name: &str, key: &str) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM cache_freshness WHERE cache_name = $1 AND cache_key = $2")
        .bind(cache_name)
        .bind(key)
        .execute(pool)
        .await?;
    Ok(())
}
