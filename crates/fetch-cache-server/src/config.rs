//! Server configuration read from the environment

use fetch_cache::CacheConfig;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub cache: CacheConfig,
    /// Postgres freshness index; an in-memory index is used when unset
    pub database_url: Option<String>,
    /// Where `GET /` redirects; the root is a 404 when unset
    pub home_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            cache: CacheConfig::default(),
            database_url: None,
            home_url: None,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source. Unparsable values fall back to defaults.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = CacheConfig::default();
        let parse_u64 = |name: &str| var(name).and_then(|s| s.parse::<u64>().ok());

        let port = var("PORT")
            .and_then(|s| s.parse::<u16>().ok())
            .unwrap_or(3000);

        let cache = CacheConfig {
            name: var("CACHE_NAME")
                .filter(|s| !s.is_empty())
                .unwrap_or(defaults.name),
            cache_dir: var("CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.cache_dir),
            default_max_age: parse_u64("CACHE_MAX_AGE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.default_max_age),
            origin_timeout: parse_u64("ORIGIN_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.origin_timeout),
            max_cache_size: parse_u64("MAX_CACHE_SIZE").unwrap_or(defaults.max_cache_size),
            max_entries: var("MAX_CACHE_ENTRIES")
                .and_then(|s| s.parse::<usize>().ok())
                .unwrap_or(defaults.max_entries),
            caller_buffer_size: parse_u64("CALLER_BUFFER_SIZE")
                .unwrap_or(defaults.caller_buffer_size),
        };

        let database_url = var("DATABASE_URL").filter(|s| !s.is_empty());
        let home_url = var("HOME_URL").filter(|s| !s.is_empty());

        Self {
            port,
            cache,
            database_url,
            home_url,
        }
    }
}
