use crate::types::CacheKey;
use sha2::{Digest, Sha256};

/// Derive the cache key for a resource identifier (hex SHA-256)
pub fn fingerprint(identifier: &str) -> CacheKey {
    let mut hasher = Sha256::new();
    hasher.update(identifier.as_bytes());
    CacheKey::from_digest(hex::encode(hasher.finalize()))
}
