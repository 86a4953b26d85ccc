//! Error types for proxy operations.
//!
//! This module defines structured error types for the gateways:
//! - Connection errors (accept, HTTP serving, CONNECT negotiation, TLS)
//! - Certificate authority errors (loading, key generation, signing)
//! - Relay errors (upstream unreachable, timeout, body transfer)

use std::path::PathBuf;
use thiserror::Error;

/// Unified error type for connection handling.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// I/O error (socket operations).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Hyper HTTP error.
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    /// Invalid CONNECT request.
    #[error("Invalid CONNECT request: {0}")]
    InvalidConnect(String),

    /// TLS error during handshake or context construction.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Certificate issuance failed.
    #[error("Certificate issuance failed: {0}")]
    Certificate(#[from] CaError),

    /// Upgrade to tunnel failed.
    #[error("HTTP upgrade failed: {0}")]
    UpgradeFailed(String),

    /// A configured URL does not parse.
    #[error("Invalid URL '{url}': {message}")]
    InvalidUrl {
        /// The offending URL.
        url: String,
        /// Parser message.
        message: String,
    },
}

/// Result type for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;

impl From<rustls::Error> for ProxyError {
    fn from(err: rustls::Error) -> Self {
        ProxyError::Tls(err.to_string())
    }
}

/// Errors from the root certificate authority.
#[derive(Debug, Error)]
pub enum CaError {
    /// Failed to read CA material.
    #[error("Failed to read {path:?}: {source}")]
    ReadFile {
        /// File that could not be read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to write CA material.
    #[error("Failed to write {path:?}: {source}")]
    WriteFile {
        /// File or directory that could not be written.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The root certificate is missing or malformed.
    #[error("Invalid root certificate: {0}")]
    InvalidCertificate(String),

    /// The root private key is missing or malformed.
    #[error("Invalid root private key: {0}")]
    InvalidKey(String),

    /// The hostname cannot be placed in a certificate.
    #[error("Invalid hostname '{0}'")]
    InvalidHostname(String),

    /// Failed to generate a key pair.
    #[error("Failed to generate key pair: {0}")]
    KeyGeneration(String),

    /// Failed to sign a certificate.
    #[error("Failed to sign certificate: {0}")]
    Signing(String),
}

/// Errors while relaying a request to its destination.
///
/// None of the detail reaches the client; see [`RelayError::status`].
#[derive(Debug, Error)]
pub enum RelayError {
    /// The destination did not answer in time.
    #[error("Upstream timed out")]
    Timeout,

    /// The destination could not be reached.
    #[error("Upstream unreachable: {0}")]
    Unreachable(String),

    /// Sending the request or reading the response failed.
    #[error("Upstream exchange failed: {0}")]
    Upstream(String),
}

impl RelayError {
    pub(crate) fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RelayError::Timeout
        } else if err.is_connect() {
            RelayError::Unreachable(err.to_string())
        } else {
            RelayError::Upstream(err.to_string())
        }
    }

    /// Client-visible status: 504 for timeouts, 502 otherwise.
    pub fn status(&self) -> hyper::StatusCode {
        match self {
            RelayError::Timeout => hyper::StatusCode::GATEWAY_TIMEOUT,
            _ => hyper::StatusCode::BAD_GATEWAY,
        }
    }

    /// Client-visible message.
    pub fn public_message(&self) -> &'static str {
        match self {
            RelayError::Timeout => "gateway timeout",
            _ => "bad gateway",
        }
    }
}
