//! Audit event types for structured logging.
//!
//! These events are written to syslog with the `TIM_GATEWAY` tag.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::federation::GateMode;

/// Audit events emitted by the gateways.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    /// A gateway listener started accepting connections.
    GatewayStart {
        /// Which gateway (`inbound` or `outbound`).
        gateway: String,
        /// Bound socket address.
        listen: String,
    },

    /// A gateway listener stopped.
    GatewayStop {
        /// Which gateway (`inbound` or `outbound`).
        gateway: String,
    },

    /// A federation check passed.
    FederationAllow {
        /// Direction of the checked request.
        mode: GateMode,
        /// Claimed domain, after cleanup.
        domain: String,
    },

    /// A federation check failed.
    ///
    /// `enforced = false` records a would-be denial while enforcement is
    /// switched off.
    FederationDeny {
        /// Direction of the checked request.
        mode: GateMode,
        /// Claimed domain, if any was presented.
        domain: Option<String>,
        /// Why the check failed.
        reason: DenyCause,
        /// Whether the request was actually rejected.
        enforced: bool,
    },

    /// A leaf certificate was issued for a hostname.
    CertificateIssued {
        /// Hostname placed in CN and SAN.
        hostname: String,
    },

    /// The federation allow-list was replaced by a newer version.
    AllowListUpdated {
        /// Application-level version token of the new list.
        version: String,
        /// Number of domains in the new list.
        domains: usize,
    },

    /// A refresh of the federation allow-list failed.
    AllowListUpdateFailed {
        /// Failure description.
        message: String,
    },
}

/// Reasons a federation check fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyCause {
    /// No usable X-Matrix authorization header.
    MissingCredentials,
    /// The claimed domain is not in the allow-list.
    NotFederated,
}

/// Wrapper for serializing events with timestamp.
#[derive(Debug, Clone, Serialize)]
pub struct TimestampedEvent<'a> {
    /// ISO8601 timestamp.
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,

    /// The event itself, flattened next to the timestamp.
    #[serde(flatten)]
    pub event: &'a AuditEvent,
}

impl AuditEvent {
    /// Wrap this event with the current time for serialization.
    pub fn with_timestamp(&self) -> TimestampedEvent<'_> {
        TimestampedEvent {
            timestamp: Utc::now(),
            event: self,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_start_serialization() {
        let event = AuditEvent::GatewayStart {
            gateway: "outbound".to_string(),
            listen: "0.0.0.0:8093".to_string(),
        };

        let json = serde_json::to_string(&event.with_timestamp()).unwrap();

        assert!(json.contains("\"event\":\"gateway_start\""));
        assert!(json.contains("\"gateway\":\"outbound\""));
        assert!(json.contains("\"ts\""));
    }

    #[test]
    fn test_federation_deny_serialization() {
        let event = AuditEvent::FederationDeny {
            mode: GateMode::Inbound,
            domain: Some("evil.example".to_string()),
            reason: DenyCause::NotFederated,
            enforced: false,
        };

        let json = serde_json::to_string(&event.with_timestamp()).unwrap();

        assert!(json.contains("\"event\":\"federation_deny\""));
        assert!(json.contains("\"mode\":\"inbound\""));
        assert!(json.contains("\"reason\":\"not_federated\""));
        assert!(json.contains("\"enforced\":false"));
    }

    #[test]
    fn test_missing_credentials_has_null_domain() {
        let event = AuditEvent::FederationDeny {
            mode: GateMode::Outbound,
            domain: None,
            reason: DenyCause::MissingCredentials,
            enforced: true,
        };

        let json = serde_json::to_string(&event.with_timestamp()).unwrap();

        assert!(json.contains("\"domain\":null"));
        assert!(json.contains("\"reason\":\"missing_credentials\""));
    }

    #[test]
    fn test_allow_list_updated_serialization() {
        let event = AuditEvent::AllowListUpdated {
            version: "42".to_string(),
            domains: 3,
        };

        let json = serde_json::to_string(&event.with_timestamp()).unwrap();

        assert!(json.contains("\"event\":\"allow_list_updated\""));
        assert!(json.contains("\"version\":\"42\""));
        assert!(json.contains("\"domains\":3"));
    }
}
