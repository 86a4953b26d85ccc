//! Error types for the federation module.

use thiserror::Error;

use crate::cache::CacheError;

/// Errors raised while setting up the federation allow-list.
#[derive(Debug, Error)]
pub enum FederationError {
    /// The configured directory URL does not parse.
    #[error("Invalid federation list URL '{url}': {message}")]
    InvalidUrl {
        /// The configured URL.
        url: String,
        /// Parser message.
        message: String,
    },

    /// The HTTP client could not be built.
    #[error("Failed to build federation list client: {0}")]
    Client(#[from] reqwest::Error),

    /// The on-disk cache could not be opened.
    #[error(transparent)]
    Cache(#[from] CacheError),
}
