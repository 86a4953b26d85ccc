//! Configuration system for tim-gateway.
//!
//! TOML files are layered in this order, later layers winning per key:
//!
//! 1. Embedded defaults
//! 2. System config: `/etc/tim-gateway/config.toml`
//! 3. User config: `~/.config/tim-gateway/config.toml`
//! 4. Additional config file (via `--config` flag)
//! 5. CLI flags (highest priority)
//!
//! Tables are merged key by key; scalars and lists are replaced.
//!
//! ```toml
//! [federation_list]
//! url = "http://registration:8080/backend/federation"
//! refresh_interval_secs = 3600
//! error_backoff_secs = 60
//!
//! [outbound]
//! ca_certificate_file = "/etc/tim-gateway/ca.crt"
//! ca_private_key_file = "/etc/tim-gateway/ca.key"
//! ```

mod error;
mod loader;
mod schema;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use schema::{
    Config, FederationListConfig, GeneralConfig, InboundConfig, OutboundConfig, RelayConfig,
};
