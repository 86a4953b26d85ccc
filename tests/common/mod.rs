//! Loopback helpers shared by the integration tests.

#![allow(dead_code)]

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::body::{Body, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tim_gateway::proxy::{ConnectionHandler, GatewayServer};
use tim_gateway::telemetry::AuditLogger;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Serve `handler` on an already bound listener until the test ends.
pub fn serve_on<F, Fut, B>(listener: TcpListener, handler: F) -> SocketAddr
where
    F: Fn(Request<Incoming>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Response<B>> + Send + 'static,
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let addr = listener.local_addr().expect("listener address");
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let handler = handler.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let handler = handler.clone();
                    async move { Ok::<_, Infallible>(handler(req).await) }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    addr
}

/// Serve `handler` on a fresh loopback port.
pub async fn spawn_http<F, Fut, B>(handler: F) -> SocketAddr
where
    F: Fn(Request<Incoming>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Response<B>> + Send + 'static,
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind upstream");
    serve_on(listener, handler)
}

/// A running gateway listener; dropping it stops accepting.
pub struct RunningGateway {
    pub addr: SocketAddr,
    _shutdown: watch::Sender<bool>,
}

/// Bind `handler` on a loopback port and run the accept loop.
pub async fn spawn_gateway<H: ConnectionHandler>(name: &str, handler: Arc<H>) -> RunningGateway {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = GatewayServer::bind(
        name,
        "127.0.0.1:0".parse().expect("loopback address"),
        handler,
        shutdown_rx,
        Arc::new(AuditLogger::new_null()),
    )
    .await
    .expect("Failed to bind gateway");
    let addr = server.local_addr().expect("gateway address");
    tokio::spawn(server.run());

    RunningGateway {
        addr,
        _shutdown: shutdown_tx,
    }
}
