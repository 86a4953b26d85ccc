//! Audit telemetry for the gateway.
//!
//! Two separate channels exist:
//!
//! - **Diagnostics** go through `tracing` (stderr, filtered by `-v`/`RUST_LOG`).
//! - **Audit events** (federation decisions, certificate issuance, allow-list
//!   refreshes) are written as single-line JSON to syslog under the
//!   `TIM_GATEWAY` tag so they can be collected independently of log levels.
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use tim_gateway::telemetry::{AuditEvent, AuditLogger};
//!
//! let audit = Arc::new(AuditLogger::new()?);
//! audit.log(AuditEvent::CertificateIssued { hostname: "matrix.example.org".into() });
//! ```
//!
//! # Event Format
//!
//! ```json
//! {"ts":"2026-01-07T14:32:01Z","event":"federation_deny","mode":"inbound","domain":"evil.example","reason":"not_federated","enforced":true}
//! ```

mod error;
mod events;
mod syslog;

pub use error::TelemetryError;
pub use events::{AuditEvent, DenyCause};
pub use syslog::{AuditLogger, SYSLOG_TAG};
