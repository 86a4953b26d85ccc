//! HTTP CONNECT handling with TLS termination.
//!
//! This module runs the per-connection state machine of the outbound
//! gateway. The flow is:
//!
//! 1. Client sends: `CONNECT matrix.example.org:443 HTTP/1.1`
//! 2. Proxy answers `200 OK` and keeps the connection
//! 3. Once the response is flushed, the connection is upgraded and a TLS
//!    server handshake runs with a certificate issued for the CONNECT host
//! 4. Requests decoded from the TLS stream get `Host: <destination>` and are
//!    handed to the downstream service (the outbound gateway)
//!
//! ```text
//!  AwaitingRequest --CONNECT ok--> Tunneling --close--> (gone)
//!        |                            |
//!        +--bad target: 400, close    +--CONNECT again: 400, stays open
//!        +--plain request: downstream as sent
//! ```
//!
//! # Example
//!
//! ```ignore
//! use tim_gateway::proxy::TunnelHandler;
//! use std::sync::Arc;
//!
//! let handler = Arc::new(TunnelHandler::new(cert_cache, outbound_gateway));
//! let (stream, _) = listener.accept().await?;
//! tokio::spawn(handler.serve(stream));
//! ```

use std::convert::Infallible;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use hyper::body::Incoming;
use hyper::header::{HOST, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

use super::body::{RelayBody, closing_text_response, empty_body, full_body, response_with};
use super::ca::CertificateIssuer;
use super::destination::Destination;
use super::error::{ProxyError, ProxyResult};
use super::tls::CertificateCache;

/// Service that receives the decrypted requests of a tunnel.
pub trait Downstream: Send + Sync + 'static {
    /// Handle one request. Errors are expressed as responses.
    fn call(&self, req: Request<Incoming>) -> impl Future<Output = Response<RelayBody>> + Send;
}

/// Phase of a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelPhase {
    /// Plaintext; waiting for CONNECT.
    AwaitingRequest,
    /// TLS terminated; requests go downstream.
    Tunneling,
}

/// What to do with one decoded request.
#[derive(Debug)]
pub enum Step<B> {
    /// Answer 200, then upgrade the connection and terminate TLS.
    Connect {
        /// The CONNECT request, needed for the upgrade.
        request: Request<B>,
        /// Parsed CONNECT target.
        destination: Destination,
    },
    /// Pass downstream; inside a tunnel `Host` carries the destination.
    Forward(Request<B>),
    /// Answer `400 text/plain`.
    Reject {
        /// Response text.
        message: String,
        /// Whether the connection closes after the response.
        close: bool,
    },
}

/// Per-connection tunnel state: phase plus the remembered destination.
#[derive(Debug, Clone)]
pub struct TunnelState {
    phase: TunnelPhase,
    destination: Option<Destination>,
}

impl Default for TunnelState {
    fn default() -> Self {
        Self::new()
    }
}

impl TunnelState {
    /// State of a freshly accepted connection.
    pub fn new() -> Self {
        Self {
            phase: TunnelPhase::AwaitingRequest,
            destination: None,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> TunnelPhase {
        self.phase
    }

    /// Destination named by the accepted CONNECT.
    pub fn destination(&self) -> Option<&Destination> {
        self.destination.as_ref()
    }

    /// Decide how to handle `req` and advance the state.
    ///
    /// Only the initial CONNECT is strict: a bad target rejects and closes.
    /// Once tunneling, a stray CONNECT is rejected but the connection stays.
    pub fn route<B>(&mut self, mut req: Request<B>) -> Step<B> {
        let is_connect = req.method() == Method::CONNECT;

        match (self.phase, is_connect) {
            (TunnelPhase::AwaitingRequest, true) => {
                let target = req.uri().authority().map(|a| a.to_string());
                match target.as_deref().map(Destination::parse) {
                    Some(Ok(destination)) => {
                        self.phase = TunnelPhase::Tunneling;
                        self.destination = Some(destination.clone());
                        Step::Connect {
                            request: req,
                            destination,
                        }
                    }
                    Some(Err(e)) => Step::Reject {
                        message: e.to_string(),
                        close: true,
                    },
                    None => Step::Reject {
                        message: "Missing authority in CONNECT request".into(),
                        close: true,
                    },
                }
            }
            (TunnelPhase::Tunneling, true) => {
                warn!(
                    "Unexpected CONNECT {} inside tunnel to {:?}",
                    req.uri(),
                    self.destination
                );
                Step::Reject {
                    message: "already tunneling".into(),
                    close: false,
                }
            }
            (_, false) => {
                // Plain requests keep their own Host and are routed downstream.
                let Some(ref destination) = self.destination else {
                    return Step::Forward(req);
                };
                match HeaderValue::from_str(&destination.to_string()) {
                    Ok(host) => {
                        req.headers_mut().insert(HOST, host);
                        Step::Forward(req)
                    }
                    Err(_) => Step::Reject {
                        message: format!("Invalid destination {}", destination),
                        close: true,
                    },
                }
            }
        }
    }
}

/// Serves client connections of the outbound gateway.
pub struct TunnelHandler<I: CertificateIssuer, D: Downstream> {
    certs: Arc<CertificateCache<I>>,
    downstream: Arc<D>,
}

impl<I: CertificateIssuer, D: Downstream> TunnelHandler<I, D> {
    /// Create a handler issuing certificates from `certs` and forwarding
    /// decrypted requests to `downstream`.
    pub fn new(certs: Arc<CertificateCache<I>>, downstream: Arc<D>) -> Self {
        Self { certs, downstream }
    }

    /// Serve one client connection until it closes.
    pub async fn serve<IO>(self: Arc<Self>, io: IO) -> ProxyResult<()>
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let state = Arc::new(Mutex::new(TunnelState::new()));
        let service = {
            let handler = self.clone();
            service_fn(move |req: Request<Incoming>| {
                let handler = handler.clone();
                let state = state.clone();
                async move { Ok::<_, Infallible>(handler.dispatch(req, state).await) }
            })
        };

        // Serve HTTP/1.1 with support for upgrades (needed for CONNECT)
        http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .serve_connection(TokioIo::new(io), service)
            .with_upgrades()
            .await
            .map_err(ProxyError::from)
    }

    async fn dispatch(
        self: Arc<Self>,
        req: Request<Incoming>,
        state: Arc<Mutex<TunnelState>>,
    ) -> Response<RelayBody> {
        let step = state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .route(req);

        match step {
            Step::Connect {
                request,
                destination,
            } => {
                debug!("CONNECT request to {}", destination);
                self.establish_tunnel(request, destination, state);
                response_with(StatusCode::OK, empty_body())
            }
            Step::Forward(req) => self.downstream.call(req).await,
            Step::Reject { message, close } => reject(message, close),
        }
    }

    /// Handle a request decoded from the terminated TLS stream.
    async fn tunneled(
        self: Arc<Self>,
        req: Request<Incoming>,
        state: Arc<Mutex<TunnelState>>,
    ) -> Response<RelayBody> {
        let step = state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .route(req);

        match step {
            Step::Forward(req) => self.downstream.call(req).await,
            Step::Reject { message, close } => reject(message, close),
            Step::Connect { destination, .. } => {
                warn!("Ignoring CONNECT to {} on a terminated stream", destination);
                reject("already tunneling".into(), false)
            }
        }
    }

    /// Spawn the task that takes over the connection after the 200 is flushed.
    fn establish_tunnel(
        self: Arc<Self>,
        req: Request<Incoming>,
        destination: Destination,
        state: Arc<Mutex<TunnelState>>,
    ) {
        tokio::spawn(async move {
            if let Err(e) = self.tunnel_connection(req, &destination, state).await {
                // Don't log as error - connection resets are common
                debug!("Tunnel ended for {}: {}", destination, e);
            }
        });
    }

    /// Terminate TLS on the upgraded connection and serve the decrypted requests.
    ///
    /// If no certificate can be issued the connection is dropped without a
    /// handshake.
    async fn tunnel_connection(
        self: Arc<Self>,
        req: Request<Incoming>,
        destination: &Destination,
        state: Arc<Mutex<TunnelState>>,
    ) -> ProxyResult<()> {
        let upgraded = hyper::upgrade::on(req)
            .await
            .map_err(|e| ProxyError::UpgradeFailed(e.to_string()))?;

        let config = match self.certs.impersonating_tls_config(&destination.host).await {
            Ok(config) => config,
            Err(e) => {
                warn!("No certificate for {}, dropping connection: {}", destination, e);
                return Err(e);
            }
        };

        let client_tls = TlsAcceptor::from(config)
            .accept(TokioIo::new(upgraded))
            .await
            .map_err(|e| ProxyError::Tls(format!("Client TLS handshake failed: {}", e)))?;

        debug!("TLS established with client for {}", destination);

        let service = {
            let handler = self.clone();
            service_fn(move |req: Request<Incoming>| {
                let handler = handler.clone();
                let state = state.clone();
                async move { Ok::<_, Infallible>(handler.tunneled(req, state).await) }
            })
        };

        http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .serve_connection(TokioIo::new(client_tls), service)
            .await?;

        debug!("Tunnel closed for {}", destination);
        Ok(())
    }
}

fn reject(message: String, close: bool) -> Response<RelayBody> {
    debug!("Rejecting request: {}", message);
    if close {
        closing_text_response(StatusCode::BAD_REQUEST, &message)
    } else {
        response_with(StatusCode::BAD_REQUEST, full_body(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(method: Method, uri: &str) -> Request<()> {
        Request::builder().method(method).uri(uri).body(()).unwrap()
    }

    #[test]
    fn test_connect_moves_to_tunneling() {
        let mut state = TunnelState::new();
        assert_eq!(state.phase(), TunnelPhase::AwaitingRequest);

        match state.route(request(Method::CONNECT, "example.org:443")) {
            Step::Connect { destination, .. } => {
                assert_eq!(destination.to_string(), "example.org:443");
            }
            other => panic!("Expected Connect, got {:?}", other),
        }
        assert_eq!(state.phase(), TunnelPhase::Tunneling);
        assert_eq!(state.destination().map(|d| d.port), Some(443));
    }

    #[test]
    fn test_requests_in_tunnel_get_host() {
        let mut state = TunnelState::new();
        state.route(request(Method::CONNECT, "example.org:443"));

        let mut req = request(Method::GET, "/_matrix/federation/v1/version");
        req.headers_mut()
            .insert(HOST, HeaderValue::from_static("something.else"));

        match state.route(req) {
            Step::Forward(req) => assert_eq!(req.headers()[HOST], "example.org:443"),
            other => panic!("Expected Forward, got {:?}", other),
        }
    }

    #[test]
    fn test_bad_connect_target_closes() {
        let mut state = TunnelState::new();
        match state.route(request(Method::CONNECT, "example.org:notaport")) {
            Step::Reject { close, .. } => assert!(close),
            other => panic!("Expected Reject, got {:?}", other),
        }
        assert_eq!(state.phase(), TunnelPhase::AwaitingRequest);
    }

    #[test]
    fn test_request_before_connect_forwarded_unchanged() {
        let mut state = TunnelState::new();
        let mut req = request(Method::GET, "/actuator/health");
        req.headers_mut()
            .insert(HOST, HeaderValue::from_static("hs.internal:8080"));

        match state.route(req) {
            Step::Forward(req) => assert_eq!(req.headers()[HOST], "hs.internal:8080"),
            other => panic!("Expected Forward, got {:?}", other),
        }
        assert_eq!(state.phase(), TunnelPhase::AwaitingRequest);
        assert!(state.destination().is_none());

        // A later CONNECT still opens the tunnel.
        assert!(matches!(
            state.route(request(Method::CONNECT, "example.org:443")),
            Step::Connect { .. }
        ));
    }

    #[test]
    fn test_request_without_host_before_connect_forwarded() {
        let mut state = TunnelState::new();
        match state.route(request(Method::GET, "/_matrix/federation/v1/version")) {
            Step::Forward(req) => assert!(req.headers().get(HOST).is_none()),
            other => panic!("Expected Forward, got {:?}", other),
        }
    }

    #[test]
    fn test_second_connect_keeps_connection() {
        let mut state = TunnelState::new();
        state.route(request(Method::CONNECT, "example.org:443"));

        match state.route(request(Method::CONNECT, "other.org:443")) {
            Step::Reject { close, .. } => assert!(!close),
            other => panic!("Expected Reject, got {:?}", other),
        }
        assert_eq!(state.destination().map(|d| d.host.as_str()), Some("example.org"));
    }
}
