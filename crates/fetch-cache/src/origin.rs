//! Origin fetching

use crate::error::OriginError;
use crate::types::ByteStream;
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::Client;
use std::io;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";
const USER_AGENT: &str = concat!("fetch-cache/", env!("CARGO_PKG_VERSION"));

/// A successful origin response whose body has not been read yet
pub struct OriginResponse {
    pub content_type: String,
    pub content_length: Option<u64>,
    pub body: ByteStream,
}

/// Retrieves resources from the remote origin
#[async_trait]
pub trait OriginFetcher: Send + Sync {
    async fn fetch(&self, identifier: &str) -> Result<OriginResponse, OriginError>;
}

/// HTTP client for fetching resources from their origin servers
pub struct HttpOriginFetcher {
    client: Client,
    timeout: Duration,
}

impl HttpOriginFetcher {
    /// Create a fetcher whose requests give up after `timeout` without response
    /// headers, or once the body goes `timeout` without delivering any data
    pub fn new(timeout: Duration) -> Self {
        let client = Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .expect("Failed to create HTTP client");

        Self { client, timeout }
    }
}

#[async_trait]
impl OriginFetcher for HttpOriginFetcher {
    async fn fetch(&self, identifier: &str) -> Result<OriginResponse, OriginError> {
        let url = parse_origin_url(identifier)?;
        debug!(url = %url, "Fetching from origin");

        let response = tokio::time::timeout(self.timeout, self.client.get(url.clone()).send())
            .await
            .map_err(|_| OriginError::Timeout)??;

        if !response.status().is_success() {
            warn!(status = %response.status(), url = %url, "Origin request failed");
            return Err(OriginError::from_status(response.status().as_u16()));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(DEFAULT_CONTENT_TYPE)
            .to_string();

        // A compressed body can differ from the header, so trust reqwest's view first
        let content_length = response.content_length().or_else(|| {
            response
                .headers()
                .get(CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
        });

        debug!(
            url = %url,
            content_type = %content_type,
            content_length = ?content_length,
            "Origin responded"
        );

        let body = response
            .bytes_stream()
            .map_err(|e| io::Error::other(OriginError::from(e)))
            .boxed();

        Ok(OriginResponse {
            content_type,
            content_length,
            body,
        })
    }
}

/// Identifiers must be absolute http(s) URLs
pub(crate) fn parse_origin_url(identifier: &str) -> Result<Url, OriginError> {
    let url = Url::parse(identifier).map_err(|e| OriginError::InvalidUrl(e.to_string()))?;
    match url.scheme() {
        "http" | "https" if url.host().is_some() => Ok(url),
        scheme => Err(OriginError::InvalidUrl(format!(
            "unsupported URL {} (scheme {})",
            identifier, scheme
        ))),
    }
}
