//! Error types for the fetch-through cache

use std::fmt;
use std::io;

/// Failure talking to the origin
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OriginError {
    /// Origin answered 404 or 410
    NotFound,
    /// Origin rejected the request with another 4xx status
    ClientError(u16),
    /// Origin answered with a 5xx status
    ServerError(u16),
    Timeout,
    ConnectionError(String),
    /// Identifier is not an absolute http(s) URL
    InvalidUrl(String),
}

impl OriginError {
    /// Map a non-success HTTP status to the matching variant
    pub fn from_status(status: u16) -> Self {
        match status {
            404 | 410 => OriginError::NotFound,
            400..=499 => OriginError::ClientError(status),
            _ => OriginError::ServerError(status),
        }
    }
}

impl fmt::Display for OriginError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OriginError::NotFound => write!(f, "Origin resource not found"),
            OriginError::ClientError(status) => {
                write!(f, "Origin rejected request with status {}", status)
            }
            OriginError::ServerError(status) => write!(f, "Origin server error: status {}", status),
            OriginError::Timeout => write!(f, "Origin request timed out"),
            OriginError::ConnectionError(msg) => write!(f, "Origin connection error: {}", msg),
            OriginError::InvalidUrl(msg) => write!(f, "Invalid origin URL: {}", msg),
        }
    }
}

impl std::error::Error for OriginError {}

impl From<reqwest::Error> for OriginError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            OriginError::Timeout
        } else if let Some(status) = err.status() {
            OriginError::from_status(status.as_u16())
        } else if err.is_builder() {
            OriginError::InvalidUrl(err.to_string())
        } else {
            OriginError::ConnectionError(err.to_string())
        }
    }
}

/// Failure reading or writing the blob store
#[derive(Debug)]
pub enum StoreError {
    NotFound,
    /// Metadata record unreadable or inconsistent with its payload
    Corrupt(String),
    /// Payload stream ended early, errored, or disagreed with its declared length
    Incomplete(String),
    StorageFailure(Box<io::Error>),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotFound => write!(f, "Blob not found"),
            StoreError::Corrupt(msg) => write!(f, "Corrupt blob entry: {}", msg),
            StoreError::Incomplete(msg) => write!(f, "Incomplete blob write: {}", msg),
            StoreError::StorageFailure(err) => write!(f, "Storage failure: {}", err),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::StorageFailure(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<io::Error> for StoreError {
    fn from(err: io::Error) -> Self {
        StoreError::StorageFailure(Box::new(err))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Corrupt(err.to_string())
    }
}

/// Failure talking to the freshness index
#[derive(Debug, Clone)]
pub enum IndexError {
    Unavailable(String),
}

impl fmt::Display for IndexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexError::Unavailable(msg) => write!(f, "Freshness index unavailable: {}", msg),
        }
    }
}

impl std::error::Error for IndexError {}

/// Top-level error returned by [`crate::FetchCache`]
#[derive(Debug)]
pub enum CacheError {
    Origin(OriginError),
    Storage(StoreError),
    Index(IndexError),
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::Origin(err) => write!(f, "{}", err),
            CacheError::Storage(err) => write!(f, "{}", err),
            CacheError::Index(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CacheError::Origin(err) => Some(err),
            CacheError::Storage(err) => Some(err),
            CacheError::Index(err) => Some(err),
        }
    }
}

impl From<OriginError> for CacheError {
    fn from(err: OriginError) -> Self {
        CacheError::Origin(err)
    }
}

impl From<StoreError> for CacheError {
    fn from(err: StoreError) -> Self {
        CacheError::Storage(err)
    }
}

impl From<IndexError> for CacheError {
    fn from(err: IndexError) -> Self {
        CacheError::Index(err)
    }
}

impl From<io::Error> for CacheError {
    fn from(err: io::Error) -> Self {
        CacheError::Storage(StoreError::from(err))
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
