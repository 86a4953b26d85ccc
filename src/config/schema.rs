//! Configuration schema definitions.
//!
//! Every section and field has a default, so a partial file only needs the
//! keys it changes.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use super::error::ConfigError;

/// Top-level configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// General settings.
    pub general: GeneralConfig,

    /// Federation allow-list source and refresh schedule.
    pub federation_list: FederationListConfig,

    /// Inbound gateway (federation -> homeserver).
    pub inbound: InboundConfig,

    /// Outbound gateway (homeserver -> federation, CONNECT/TLS).
    pub outbound: OutboundConfig,

    /// Relay behaviour shared by both gateways.
    pub relay: RelayConfig,
}

impl Config {
    /// Check cross-field constraints the type system cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let list = &self.federation_list;
        if list.error_backoff_secs == 0 {
            return Err(invalid(
                "federation_list.error_backoff_secs",
                "must be greater than zero",
            ));
        }
        if list.error_backoff_secs >= list.refresh_interval_secs {
            return Err(invalid(
                "federation_list.error_backoff_secs",
                format!(
                    "must be shorter than refresh_interval_secs ({})",
                    list.refresh_interval_secs
                ),
            ));
        }
        if reqwest::Url::parse(&list.url).is_err() {
            return Err(invalid("federation_list.url", format!("'{}' is not a URL", list.url)));
        }
        if reqwest::Url::parse(&self.inbound.homeserver_url).is_err() {
            return Err(invalid(
                "inbound.homeserver_url",
                format!("'{}' is not a URL", self.inbound.homeserver_url),
            ));
        }
        if !matches!(self.outbound.upstream_scheme.as_str(), "http" | "https") {
            return Err(invalid(
                "outbound.upstream_scheme",
                format!("'{}' is neither http nor https", self.outbound.upstream_scheme),
            ));
        }
        Ok(())
    }
}

fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message: message.into(),
    }
}

/// General application settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level used when neither `-v` nor `RUST_LOG` is given.
    pub log_level: String,

    /// Send audit events to syslog. When false, audit events are dropped.
    pub audit_syslog: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            audit_syslog: true,
        }
    }
}

/// Federation allow-list settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FederationListConfig {
    /// URL of the partner directory endpoint.
    pub url: String,

    /// Directory holding the cached list and its metadata.
    pub storage_dir: PathBuf,

    /// File name of the cached list body.
    pub file: String,

    /// File name of the refresh metadata.
    pub meta_file: String,

    /// Seconds until the next refresh after a successful fetch.
    pub refresh_interval_secs: u64,

    /// Seconds until the next refresh after a failed fetch.
    pub error_backoff_secs: u64,

    /// Pause after an unexpected failure of a whole refresh iteration.
    pub failure_cooldown_secs: u64,

    /// Overall timeout of one fetch.
    pub request_timeout_secs: u64,

    /// TCP connect timeout of one fetch.
    pub connect_timeout_secs: u64,

    /// Send the stored version as `?version=` so the service can answer 204.
    pub conditional_fetch: bool,
}

impl Default for FederationListConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8080/backend/federation".to_string(),
            storage_dir: PathBuf::from("/var/cache/tim-gateway"),
            file: "federation-list.json".to_string(),
            meta_file: "federation-list.meta.json".to_string(),
            refresh_interval_secs: 3600,
            error_backoff_secs: 60,
            failure_cooldown_secs: 60,
            request_timeout_secs: 30,
            connect_timeout_secs: 10,
            conditional_fetch: true,
        }
    }
}

impl FederationListConfig {
    /// Path of the cached list body.
    pub fn file_path(&self) -> PathBuf {
        self.storage_dir.join(&self.file)
    }

    /// Path of the refresh metadata.
    pub fn meta_path(&self) -> PathBuf {
        self.storage_dir.join(&self.meta_file)
    }

    /// Delay after a successful fetch.
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    /// Delay after a failed fetch.
    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_secs)
    }

    /// Pause after a failed refresh iteration.
    pub fn failure_cooldown(&self) -> Duration {
        Duration::from_secs(self.failure_cooldown_secs)
    }
}

/// Inbound gateway settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct InboundConfig {
    /// Address the inbound listener binds to.
    pub listen: SocketAddr,

    /// Base URL of the local homeserver.
    pub homeserver_url: String,

    /// Reject requests whose origin is not federated.
    pub enforce_domain_list: bool,

    /// Ungated path prefixes relayed to the homeserver. Other ungated
    /// paths are answered `404 M_NOT_FOUND`.
    pub pass_through_path_prefixes: Vec<String>,
}

impl Default for InboundConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8090)),
            homeserver_url: "http://localhost:8083".to_string(),
            enforce_domain_list: true,
            pass_through_path_prefixes: vec![
                "/_matrix/client/".to_string(),
                "/_matrix/media/".to_string(),
                "/.well-known/matrix/".to_string(),
            ],
        }
    }
}

/// Outbound gateway settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OutboundConfig {
    /// Address the CONNECT listener binds to.
    pub listen: SocketAddr,

    /// PEM file with the root certificate used to sign leaf certificates.
    pub ca_certificate_file: PathBuf,

    /// PEM file with the root private key.
    pub ca_private_key_file: PathBuf,

    /// Reject requests whose destination is not federated.
    pub enforce_domain_list: bool,

    /// Scheme used to reach the real destination (`https`, or `http` in tests).
    pub upstream_scheme: String,

    /// Ungated path prefixes relayed to any destination. Other ungated
    /// paths are answered `404 M_NOT_FOUND`.
    pub pass_through_path_prefixes: Vec<String>,

    /// Single sign-on host reachable on any path, e.g. `https://sso.example.org/`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sso_domain: Option<String>,
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8093)),
            ca_certificate_file: PathBuf::from("/etc/tim-gateway/ca.crt"),
            ca_private_key_file: PathBuf::from("/etc/tim-gateway/ca.key"),
            enforce_domain_list: true,
            upstream_scheme: "https".to_string(),
            pass_through_path_prefixes: vec![
                "/_matrix/push/".to_string(),
                "/recaptcha/api/siteverify".to_string(),
            ],
            sso_domain: None,
        }
    }
}

/// Relay settings shared by both gateways.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RelayConfig {
    /// TCP connect timeout towards the destination.
    pub connect_timeout_secs: u64,

    /// Overall timeout of a buffered relay. Streaming relays are unbounded.
    pub request_timeout_secs: u64,

    /// Path prefixes that must pass the federation check.
    pub gated_path_prefixes: Vec<String>,

    /// Path prefixes relayed in streaming mode.
    pub streaming_path_prefixes: Vec<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            request_timeout_secs: 60,
            gated_path_prefixes: vec![
                "/_matrix/federation/".to_string(),
                "/_matrix/key/".to_string(),
            ],
            streaming_path_prefixes: vec![
                "/_matrix/media/".to_string(),
                "/_matrix/client/v1/media/".to_string(),
                "/_matrix/federation/v1/media/".to_string(),
            ],
        }
    }
}

impl RelayConfig {
    /// TCP connect timeout towards the destination.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Timeout of a buffered relay.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
