//! TCP listeners of the two gateways.
//!
//! Each gateway owns a [`GatewayServer`]: an accept loop that spawns one task
//! per connection and stops when the shutdown flag flips. What happens on a
//! connection is decided by its [`ConnectionHandler`]:
//!
//! - [`PlainHandler`]: plain HTTP/1.1, every request goes to a [`Downstream`]
//!   (inbound gateway)
//! - [`TunnelHandler`]: CONNECT plus TLS termination (outbound gateway)
//!
//! # Example
//!
//! ```ignore
//! use tim_gateway::proxy::{GatewayServer, PlainHandler};
//! use std::sync::Arc;
//!
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! let handler = Arc::new(PlainHandler::new(inbound_gateway));
//! let server = GatewayServer::bind("inbound", addr, handler, shutdown_rx, audit).await?;
//! tokio::spawn(server.run());
//!
//! // To shutdown:
//! shutdown_tx.send(true)?;
//! ```

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::ca::CertificateIssuer;
use super::connect::{Downstream, TunnelHandler};
use super::error::{ProxyError, ProxyResult};
use crate::telemetry::{AuditEvent, AuditLogger};

/// Serves one accepted connection.
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Serve `stream` until the client goes away.
    fn handle(self: Arc<Self>, stream: TcpStream) -> impl Future<Output = ProxyResult<()>> + Send;
}

/// Plain HTTP/1.1 connections, every request handed to `D`.
pub struct PlainHandler<D: Downstream> {
    downstream: Arc<D>,
}

impl<D: Downstream> PlainHandler<D> {
    /// Create a handler forwarding to `downstream`.
    pub fn new(downstream: Arc<D>) -> Self {
        Self { downstream }
    }
}

impl<D: Downstream> ConnectionHandler for PlainHandler<D> {
    async fn handle(self: Arc<Self>, stream: TcpStream) -> ProxyResult<()> {
        let downstream = self.downstream.clone();
        let service = service_fn(move |req: Request<Incoming>| {
            let downstream = downstream.clone();
            async move { Ok::<_, Infallible>(downstream.call(req).await) }
        });

        http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .serve_connection(TokioIo::new(stream), service)
            .await
            .map_err(ProxyError::from)
    }
}

impl<I: CertificateIssuer, D: Downstream> ConnectionHandler for TunnelHandler<I, D> {
    fn handle(self: Arc<Self>, stream: TcpStream) -> impl Future<Output = ProxyResult<()>> + Send {
        self.serve(stream)
    }
}

/// Accept loop of one gateway.
pub struct GatewayServer<H: ConnectionHandler> {
    name: String,
    listener: TcpListener,
    handler: Arc<H>,
    shutdown_rx: watch::Receiver<bool>,
    audit: Arc<AuditLogger>,
}

impl<H: ConnectionHandler> GatewayServer<H> {
    /// Bind `addr`. Port 0 picks a free port; see [`Self::local_addr`].
    pub async fn bind(
        name: impl Into<String>,
        addr: SocketAddr,
        handler: Arc<H>,
        shutdown_rx: watch::Receiver<bool>,
        audit: Arc<AuditLogger>,
    ) -> ProxyResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            name: name.into(),
            listener,
            handler,
            shutdown_rx,
            audit,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> ProxyResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the shutdown flag is set.
    ///
    /// Connections already being served keep running in their own tasks.
    pub async fn run(self) -> ProxyResult<()> {
        let listen = self.local_addr()?;
        info!("{} gateway listening on {}", self.name, listen);
        self.audit.log(AuditEvent::GatewayStart {
            gateway: self.name.clone(),
            listen: listen.to_string(),
        });

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, peer)) => {
                            debug!("Accepted {} connection from {}", self.name, peer);
                            self.spawn_connection_handler(stream);
                        }
                        Err(e) => {
                            warn!("Failed to accept connection: {}", e);
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("{} gateway shutting down", self.name);
                        break;
                    }
                }
            }
        }

        self.audit.log(AuditEvent::GatewayStop {
            gateway: self.name.clone(),
        });
        Ok(())
    }

    fn spawn_connection_handler(&self, stream: TcpStream) {
        let handler = self.handler.clone();
        tokio::spawn(async move {
            if let Err(e) = handler.handle(stream).await {
                // Don't log connection resets as errors - they're common
                let err_str = e.to_string();
                if err_str.contains("connection reset")
                    || err_str.contains("broken pipe")
                    || err_str.contains("Connection reset")
                {
                    debug!("Connection ended: {}", e);
                } else {
                    warn!("Connection error: {}", e);
                }
            }
        });
    }
}
