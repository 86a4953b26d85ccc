//! Gateway proxy: TLS interception, federation gating and relaying.
//!
//! This module provides:
//! - A root certificate authority issuing leaf certificates on demand
//! - A per-hostname certificate cache with single issuance under races
//! - HTTP CONNECT handling with TLS termination (outbound gateway)
//! - A buffered/streaming relay with hop-by-hop header hygiene
//! - The inbound and outbound gateway services and their TCP listeners
//!
//! # Architecture
//!
//! ```text
//!  federation ──► inbound listener ──► Gateway(origin) ──► RelayEngine ──► homeserver
//!
//!  homeserver ──CONNECT──► outbound listener ──► TunnelHandler
//!                                                   │ TLS (leaf from CertificateCache)
//!                                                   ▼
//!                                             Gateway(destination) ──► RelayEngine ──► partner
//! ```
//!
//! # Example
//!
//! ```ignore
//! use tim_gateway::proxy::*;
//! use std::sync::Arc;
//!
//! let ca = Arc::new(CertificateAuthority::load(&cert_path, &key_path)?);
//! let relay = Arc::new(RelayEngine::new(&config.relay, &[])?);
//! let outbound = Arc::new(Gateway::outbound(&config, allow_list, relay, audit.clone()));
//! let certs = Arc::new(CertificateCache::new(ca, audit.clone()));
//! let handler = Arc::new(TunnelHandler::new(certs, outbound));
//!
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! let server = GatewayServer::bind("outbound", addr, handler, shutdown_rx, audit).await?;
//! server.run().await?;
//! ```

pub mod body;
pub mod ca;
pub mod connect;
pub mod destination;
pub mod error;
pub mod gateway;
pub mod relay;
pub mod server;
pub mod tls;

// Re-export main types for convenient access
pub use body::{BoxError, RelayBody};
pub use ca::{CertificateAuthority, CertificateIssuer, IssuedCertificate};
pub use connect::{Downstream, Step, TunnelHandler, TunnelPhase, TunnelState};
pub use destination::Destination;
pub use error::{CaError, ProxyError, ProxyResult, RelayError};
pub use gateway::{Gateway, RouteClass, Routes, Upstream};
pub use relay::{
    ByteCounter, ForwardedBody, ForwardedRequest, RelayEngine, RelayMode, Relayed,
    filter_unsafe_headers,
};
pub use server::{ConnectionHandler, GatewayServer, PlainHandler};
pub use tls::{CertificateCache, create_tls_connector};
