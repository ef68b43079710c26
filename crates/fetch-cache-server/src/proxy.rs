//! Uncached pass-through to the origin

use crate::server::{error_response, origin_status, path_suffix, stream_response, SharedState};
use axum::{
    extract::State,
    http::{StatusCode, Uri},
    response::Response,
};
use tracing::{info, warn};

const PROXY_PREFIX: &str = "/proxy/";

/// Stream a resource straight from the origin without touching the cache.
/// Unlike `/serve`, the request query string is forwarded as part of the URL.
pub async fn passthrough(State(state): State<SharedState>, uri: Uri) -> Response {
    let Some(url) = proxy_url(&uri) else {
        return error_response(StatusCode::BAD_REQUEST, "Missing identifier");
    };

    state.counters.record_proxy();

    match state.origin.fetch(&url).await {
        Ok(response) => {
            if let Some(len) = response.content_length {
                state.counters.record_proxy_bytes(len);
            }
            info!(url = %url, content_length = ?response.content_length, "Proxying resource");
            stream_response(
                &response.content_type,
                response.content_length,
                response.body,
            )
        }
        Err(e) => {
            warn!(url = %url, error = %e, "Proxy fetch failed");
            error_response(origin_status(&e), &e.to_string())
        }
    }
}

fn proxy_url(uri: &Uri) -> Option<String> {
    let path = path_suffix(uri, PROXY_PREFIX)?;
    Some(match uri.query() {
        Some(query) => format!("{}?{}", path, query),
        None => path.to_string(),
    })
}
