//! HTTP server for the cache endpoints
//!
//! Provides /, /health, /stats, /serve/{identifier} and /proxy/{identifier}.

use crate::proxy;
use crate::types::{ErrorResponse, HealthResponse, RequestCounters, StatsResponse};
use axum::{
    body::Body,
    extract::{rejection::QueryRejection, Query, State},
    http::{header, HeaderName, HeaderValue, StatusCode, Uri},
    response::{IntoResponse, Json, Redirect, Response},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use fetch_cache::{
    ByteStream, CacheError, CacheMetrics, CacheStats, FetchCache, OriginError, OriginFetcher,
};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

const X_CACHE: HeaderName = HeaderName::from_static("x-cache");
const SERVE_PREFIX: &str = "/serve/";

/// Shared state for the HTTP server
pub struct ServerState {
    pub cache: FetchCache,
    /// Used directly by the uncached pass-through route
    pub origin: Arc<dyn OriginFetcher>,
    pub metrics: Arc<CacheMetrics>,
    pub counters: RequestCounters,
    pub started_at: DateTime<Utc>,
    /// Target of the `GET /` redirect
    pub home_url: Option<String>,
}

impl ServerState {
    pub fn new(
        cache: FetchCache,
        origin: Arc<dyn OriginFetcher>,
        metrics: Arc<CacheMetrics>,
    ) -> Self {
        Self {
            cache,
            origin,
            metrics,
            counters: RequestCounters::default(),
            started_at: Utc::now(),
            home_url: None,
        }
    }

    pub fn with_home_url(mut self, home_url: Option<String>) -> Self {
        self.home_url = home_url;
        self
    }

    fn cache_stats(&self) -> CacheStats {
        self.metrics.snapshot(self.cache.usage())
    }
}

pub type SharedState = Arc<ServerState>;

#[derive(Debug, Deserialize)]
struct ServeParams {
    /// Freshness override in milliseconds
    #[serde(rename = "maxAge")]
    max_age: Option<u64>,
}

/// Create the HTTP router
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/", get(home))
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/serve/{*identifier}", get(serve))
        .route("/proxy/{*identifier}", get(proxy::passthrough))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the HTTP server
pub async fn start_server(state: SharedState, port: u16) -> std::io::Result<()> {
    let router = create_router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await
}

/// Send visitors of the bare host to the project page
async fn home(State(state): State<SharedState>) -> Response {
    match &state.home_url {
        Some(url) => Redirect::temporary(url).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "Not found"),
    }
}

/// Health check endpoint
async fn health(State(state): State<SharedState>) -> Json<HealthResponse> {
    let uptime_secs = (Utc::now() - state.started_at).num_seconds() as u64;

    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs,
        cache: state.cache_stats(),
    })
}

async fn stats(State(state): State<SharedState>) -> Json<StatsResponse> {
    Json(state.counters.stats(state.cache_stats()))
}

/// Serve a resource through the cache. The identifier is the raw path after
/// `/serve/`, exactly as sent.
async fn serve(
    State(state): State<SharedState>,
    uri: Uri,
    params: Result<Query<ServeParams>, QueryRejection>,
) -> Response {
    let Some(identifier) = path_suffix(&uri, SERVE_PREFIX) else {
        return error_response(StatusCode::BAD_REQUEST, "Missing identifier");
    };
    let params = match params {
        Ok(Query(params)) => params,
        Err(rejection) => {
            return error_response(StatusCode::BAD_REQUEST, &rejection.body_text());
        }
    };

    state.counters.record_serve(identifier);
    let max_age = params
        .max_age
        .map(Duration::from_millis)
        .unwrap_or_else(|| state.cache.default_max_age());

    match state.cache.retrieve_with_max_age(identifier, max_age).await {
        Ok(resource) => {
            let metadata = resource.metadata;
            if let Some(len) = metadata.content_length {
                state.counters.record_serve_bytes(len);
            }
            info!(
                identifier,
                source = ?resource.source,
                content_length = ?metadata.content_length,
                "Serving resource"
            );

            let mut response = stream_response(
                &metadata.content_type,
                metadata.content_length,
                resource.body,
            );
            let x_cache = if resource.source.is_hit() { "HIT" } else { "MISS" };
            response
                .headers_mut()
                .insert(X_CACHE, HeaderValue::from_static(x_cache));
            response
        }
        Err(e) => {
            warn!(identifier, error = %e, "Failed to serve resource");
            cache_error_response(&e)
        }
    }
}

/// The part of the request path after `prefix`, left percent-encoded
pub(crate) fn path_suffix<'a>(uri: &'a Uri, prefix: &str) -> Option<&'a str> {
    uri.path().strip_prefix(prefix).filter(|s| !s.is_empty())
}

pub(crate) fn stream_response(
    content_type: &str,
    content_length: Option<u64>,
    body: ByteStream,
) -> Response {
    let mut response = Response::new(Body::from_stream(body));
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    if let Some(len) = content_length {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    }
    response
}

pub(crate) fn origin_status(err: &OriginError) -> StatusCode {
    match err {
        OriginError::NotFound => StatusCode::NOT_FOUND,
        OriginError::InvalidUrl(_) => StatusCode::BAD_REQUEST,
        OriginError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        OriginError::ClientError(_)
        | OriginError::ServerError(_)
        | OriginError::ConnectionError(_) => StatusCode::BAD_GATEWAY,
    }
}

fn cache_error_response(err: &CacheError) -> Response {
    let status = match err {
        CacheError::Origin(origin) => origin_status(origin),
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, &err.to_string())
}

pub(crate) fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
        .into_response()
}
