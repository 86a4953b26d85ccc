//! tim-gateway: intercepting gateway for a federated messaging network
//!
//! This crate provides the transport core of two cooperating gateways that
//! sit between a homeserver and its federation partners.
//!
//! # Security Model
//!
//! The model is **fail-closed**: a request whose origin or destination is not
//! in the federation allow-list is denied, and a tunnel whose certificate
//! cannot be issued is dropped. Every decision is audited to syslog.
//!
//! # Architecture
//!
//! - **Cache**: periodically refreshed, crash-resilient on-disk resource cache
//! - **Federation**: partner allow-list and the per-request authorization gate
//! - **Proxy**: CONNECT/TLS interception, certificate issuance, relay, listeners
//! - **Config**: Hierarchical TOML configuration
//! - **Telemetry**: Structured syslog logging for audit trails

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod cache;
pub mod cli;
pub mod config;
pub mod federation;
pub mod proxy;
pub mod telemetry;
