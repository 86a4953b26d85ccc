//! Telemetry error types.

use thiserror::Error;

/// Errors raised while setting up or writing the audit trail.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The local syslog daemon could not be reached.
    #[error("Failed to connect to syslog: {0}")]
    SyslogConnection(String),

    /// An audit event could not be rendered as JSON.
    #[error("Failed to serialize audit event: {0}")]
    Serialization(#[from] serde_json::Error),
}
