//! Fetch cache server - HTTP front end for the fetch-through blob cache
//!
//! Serves resources from a local blob store, fetching and storing them from
//! their origin on a miss.

mod config;
mod error;
mod proxy;
mod server;
mod types;

use crate::config::ServerConfig;
use crate::error::Result;
use crate::server::{start_server, ServerState, SharedState};
use cache_freshness_db::PgFreshnessIndex;
use fetch_cache::{
    CacheMetrics, FetchCache, FreshnessIndex, HttpOriginFetcher, MemoryFreshnessIndex,
    OriginFetcher,
};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let env_filter = EnvFilter::from_default_env()
        .add_directive("fetch_cache_server=info".parse()?)
        .add_directive("fetch_cache=info".parse()?);

    // Use JSON format for GCP Cloud Logging when LOG_FORMAT=json
    if std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false)
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    };

    info!("Starting fetch cache server...");

    let config = ServerConfig::from_env();
    info!("Port: {}", config.port);
    info!("Cache name: {}", config.cache.name);
    info!("Cache dir: {:?}", config.cache.cache_dir);
    info!(
        "Max cache size: {} MB",
        config.cache.max_cache_size / (1024 * 1024)
    );
    info!("Max cache entries: {}", config.cache.max_entries);
    info!(
        "Default max age: {} seconds",
        config.cache.default_max_age.as_secs()
    );

    let index: Arc<dyn FreshnessIndex> = match &config.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new().max_connections(10).connect(url).await?;
            cache_freshness_db::migrate::migrate(&pool).await?;
            info!("Using Postgres freshness index");
            Arc::new(PgFreshnessIndex::new(pool, config.cache.name.clone()))
        }
        None => {
            warn!("DATABASE_URL not set, freshness records will not survive a restart");
            Arc::new(MemoryFreshnessIndex::new())
        }
    };

    let origin: Arc<dyn OriginFetcher> =
        Arc::new(HttpOriginFetcher::new(config.cache.origin_timeout));
    let metrics = Arc::new(CacheMetrics::new());

    let cache = FetchCache::new(&config.cache, index, origin.clone(), metrics.clone());
    cache.init().await?;

    let state: SharedState =
        Arc::new(ServerState::new(cache, origin, metrics).with_home_url(config.home_url));

    // Start HTTP server (blocking)
    start_server(state, config.port).await?;

    Ok(())
}
