//! Error types for cache operations
//!
//! Only `InvalidIdentity` is meant to reach callers of the query façade.
//! Store and serialization failures are absorbed by the cache layer and
//! degrade to cache misses or logged no-ops.

use thiserror::Error;

/// Main error type for cache operations
#[derive(Error, Debug)]
pub enum CacheError {
    /// Backing store unreachable or returned an error
    #[error("Cache store unavailable: {0}")]
    StoreUnavailable(String),

    /// Malformed key inputs, e.g. an object without a primary key
    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    /// Cached payload could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic error with context
    #[error("Error: {0}")]
    Other(String),
}

impl CacheError {
    /// Whether the error should be absorbed by the cache layer rather than
    /// surfaced to the caller
    pub fn is_degradable(&self) -> bool {
        matches!(
            self,
            CacheError::StoreUnavailable(_) | CacheError::Serialization(_)
        )
    }
}

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Serialization(e.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for CacheError {
    fn from(e: redis::RedisError) -> Self {
        CacheError::StoreUnavailable(e.to_string())
    }
}

impl From<String> for CacheError {
    fn from(s: String) -> Self {
        CacheError::Other(s)
    }
}

impl From<&str> for CacheError {
    fn from(s: &str) -> Self {
        CacheError::Other(s.to_string())
    }
}
