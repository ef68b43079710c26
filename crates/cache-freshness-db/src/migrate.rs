use sqlx::PgPool;
use tracing::info;

/// Create the freshness table if needed (versioned, tracked in `_sqlx_migrations`)
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::Error> {
    info!("Running freshness index migrations...");
    sqlx::migrate!()
        .run(pool)
        .await
        .map_err(|e| sqlx::Error::Protocol(e.to_string()))?;
    info!("Freshness index migrations completed");
    Ok(())
}
