//! Error types for the periodic resource cache.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the cache engine and its on-disk store.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Reading, creating or replacing a storage file failed.
    #[error("Cache storage error at {path:?}: {source}")]
    Storage {
        /// File or directory involved.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The metadata file exists but does not hold valid metadata JSON.
    #[error("Corrupt cache metadata in {path:?}: {source}")]
    CorruptMetadata {
        /// Metadata file.
        path: PathBuf,
        /// JSON decoding error.
        #[source]
        source: serde_json::Error,
    },

    /// Metadata could not be encoded.
    #[error("Failed to encode cache metadata: {0}")]
    Encode(#[from] serde_json::Error),

    /// Fetched or stored content could not be parsed into a value.
    #[error("Failed to parse cached resource: {0}")]
    Parse(String),
}

impl CacheError {
    pub(crate) fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CacheError::Storage {
            path: path.into(),
            source,
        }
    }
}
