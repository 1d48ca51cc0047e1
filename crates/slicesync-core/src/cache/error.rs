//! Cache error handling
//!
//! Typed errors for local cache operations. The typed `try_*` API returns
//! these; the best-effort API logs them and carries on.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during local cache operations
#[derive(Error, Debug)]
pub enum CacheError {
    /// Value could not be serialized to JSON
    #[error("Failed to serialize value for '{key}': {source}")]
    Serialize {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// Stored JSON does not match the requested type
    #[error("Cached value at '{key}' could not be deserialized: {source}")]
    Deserialize {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// Serialized entry is larger than the configured quota
    #[error("Entry '{key}' is {size} bytes, over the {limit} byte quota")]
    QuotaExceeded {
        key: String,
        size: usize,
        limit: usize,
    },

    /// Failed to create the directory holding the cache database
    #[error("Failed to create cache directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// SQLite database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl CacheError {
    /// Check whether this is a quota failure
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, CacheError::QuotaExceeded { .. })
    }

    /// The cache key involved, when known
    pub fn key(&self) -> Option<&str> {
        match self {
            CacheError::Serialize { key, .. }
            | CacheError::Deserialize { key, .. }
            | CacheError::QuotaExceeded { key, .. } => Some(key),
            _ => None,
        }
    }
}

/// Result type for cache operations
pub type CacheResult<T> = Result<T, CacheError>;
