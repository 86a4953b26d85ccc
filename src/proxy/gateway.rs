//! Inbound and outbound gateway services.
//!
//! A [`Gateway`] takes one decoded request and sorts its path into one of
//! three classes:
//!
//! | Class | Handling |
//! |---|---|
//! | gated | federation check, then relay |
//! | pass-through | relay without a federation claim |
//! | unhandled | `404 M_NOT_FOUND`, unless the destination is a pass-through host |
//!
//! All failures become Matrix-style JSON responses.

use std::sync::Arc;

use bytes::Bytes;
use hyper::body::{Body, Incoming};
use hyper::header::HOST;
use hyper::{Request, Response, StatusCode};
use reqwest::Url;
use tracing::{debug, warn};

use super::body::{BoxError, RelayBody, matrix_error};
use super::connect::Downstream;
use super::destination::Destination;
use super::error::ProxyError;
use super::relay::{RelayEngine, RelayMode};
use crate::config::Config;
use crate::federation::{FederationAllowList, FederationGate, GateMode, clean_domain};
use crate::telemetry::AuditLogger;

/// Where a gateway sends its requests.
#[derive(Debug, Clone)]
pub enum Upstream {
    /// A fixed base URL; the request path and query are appended to its path.
    Homeserver(Url),
    /// The host named by the request's `Host` header.
    Destination {
        /// `https`, or `http` for plaintext test destinations.
        scheme: String,
    },
}

/// How a request path is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteClass {
    /// Must pass the federation check.
    Gated,
    /// Relayed without a federation check.
    PassThrough,
    /// Only relayed to a pass-through host.
    Unhandled,
}

/// Path and host rules of one gateway.
#[derive(Debug, Clone, Default)]
pub struct Routes {
    /// Prefixes checked by the federation gate.
    pub gated_prefixes: Vec<String>,
    /// Prefixes relayed without a check.
    pub pass_through_prefixes: Vec<String>,
    /// Destination hosts reachable on any path.
    pub pass_through_hosts: Vec<String>,
    /// Prefixes relayed in streaming mode.
    pub streaming_prefixes: Vec<String>,
}

impl Routes {
    /// Class of `path`. Gated prefixes win over pass-through ones.
    pub fn classify(&self, path: &str) -> RouteClass {
        if has_prefix(&self.gated_prefixes, path) {
            RouteClass::Gated
        } else if has_prefix(&self.pass_through_prefixes, path) {
            RouteClass::PassThrough
        } else {
            RouteClass::Unhandled
        }
    }

    /// Whether `host` may be reached on any path.
    pub fn is_pass_through_host(&self, host: &str) -> bool {
        self.pass_through_hosts.iter().any(|h| h == host)
    }

    /// Relay mode for `path`.
    pub fn relay_mode(&self, path: &str) -> RelayMode {
        if has_prefix(&self.streaming_prefixes, path) {
            RelayMode::Streaming
        } else {
            RelayMode::Buffered
        }
    }
}

fn has_prefix(prefixes: &[String], path: &str) -> bool {
    prefixes.iter().any(|p| path.starts_with(p.as_str()))
}

/// One gateway direction: gate, routing and relay.
#[derive(Debug)]
pub struct Gateway {
    gate: FederationGate,
    relay: Arc<RelayEngine>,
    upstream: Upstream,
    routes: Routes,
}

impl Gateway {
    /// Assemble a gateway from its parts.
    pub fn new(
        gate: FederationGate,
        relay: Arc<RelayEngine>,
        upstream: Upstream,
        routes: Routes,
    ) -> Self {
        Self {
            gate,
            relay,
            upstream,
            routes,
        }
    }

    /// Federation -> homeserver, checking the `origin` claim.
    pub fn inbound(
        config: &Config,
        allow_list: FederationAllowList,
        relay: Arc<RelayEngine>,
        audit: Arc<AuditLogger>,
    ) -> Result<Self, ProxyError> {
        let homeserver = &config.inbound.homeserver_url;
        let base = Url::parse(homeserver).map_err(|e| ProxyError::InvalidUrl {
            url: homeserver.clone(),
            message: e.to_string(),
        })?;

        let gate = FederationGate::new(
            GateMode::Inbound,
            allow_list,
            config.inbound.enforce_domain_list,
            audit,
        );
        let routes = Routes {
            gated_prefixes: config.relay.gated_path_prefixes.clone(),
            pass_through_prefixes: config.inbound.pass_through_path_prefixes.clone(),
            pass_through_hosts: Vec::new(),
            streaming_prefixes: config.relay.streaming_path_prefixes.clone(),
        };
        Ok(Self::new(gate, relay, Upstream::Homeserver(base), routes))
    }

    /// Homeserver -> federation, checking the `destination` claim.
    pub fn outbound(
        config: &Config,
        allow_list: FederationAllowList,
        relay: Arc<RelayEngine>,
        audit: Arc<AuditLogger>,
    ) -> Self {
        let gate = FederationGate::new(
            GateMode::Outbound,
            allow_list,
            config.outbound.enforce_domain_list,
            audit,
        );
        let routes = Routes {
            gated_prefixes: config.relay.gated_path_prefixes.clone(),
            pass_through_prefixes: config.outbound.pass_through_path_prefixes.clone(),
            pass_through_hosts: config
                .outbound
                .sso_domain
                .iter()
                .map(|d| clean_domain(d).trim_end_matches('/').to_string())
                .collect(),
            streaming_prefixes: config.relay.streaming_path_prefixes.clone(),
        };
        Self::new(
            gate,
            relay,
            Upstream::Destination {
                scheme: config.outbound.upstream_scheme.clone(),
            },
            routes,
        )
    }

    /// Direction of this gateway.
    pub fn mode(&self) -> GateMode {
        self.gate.mode()
    }

    /// Path and host rules.
    pub fn routes(&self) -> &Routes {
        &self.routes
    }

    /// Destination URL of `req`, or the response to send instead.
    pub fn upstream_url<B>(&self, req: &Request<B>) -> Result<Url, Response<RelayBody>> {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        match &self.upstream {
            Upstream::Homeserver(base) => Ok(merge_onto(base, path_and_query)),
            Upstream::Destination { scheme } => {
                let Some(host) = req.headers().get(HOST).and_then(|h| h.to_str().ok()) else {
                    return Err(matrix_error(
                        StatusCode::BAD_REQUEST,
                        "M_BAD_JSON",
                        "host header was not set",
                    ));
                };
                let destination = Destination::parse(host).map_err(|e| {
                    debug!("Unusable Host header '{}': {}", host, e);
                    matrix_error(StatusCode::BAD_REQUEST, "M_BAD_JSON", "invalid host header")
                })?;
                Url::parse(&format!("{}://{}{}", scheme, destination, path_and_query)).map_err(
                    |e| {
                        debug!("Cannot build URL for {}: {}", destination, e);
                        matrix_error(StatusCode::BAD_REQUEST, "M_BAD_JSON", "invalid host header")
                    },
                )
            }
        }
    }

    /// Handle one request end to end.
    pub async fn handle<B>(&self, req: Request<B>) -> Response<RelayBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let path = req.uri().path().to_string();
        let class = self.routes.classify(&path);

        if class == RouteClass::Gated {
            if let Err(rejection) = self.gate.authorize(req.headers(), &path) {
                return matrix_error(rejection.status(), rejection.errcode(), &rejection.to_string());
            }
        }

        let url = match self.upstream_url(&req) {
            Ok(url) => url,
            Err(response) => return response,
        };

        if class == RouteClass::Unhandled
            && !url.host_str().is_some_and(|h| self.routes.is_pass_through_host(h))
        {
            warn!(
                "{} request on unhandled path {} {} for {}",
                self.mode(),
                req.method(),
                path,
                url.host_str().unwrap_or("-")
            );
            return matrix_error(StatusCode::NOT_FOUND, "M_NOT_FOUND", "unrecognized request");
        }

        match self.relay.forward(req, url, self.routes.relay_mode(&path)).await {
            Ok(relayed) => relayed.response,
            Err(e) => {
                warn!("{} relay of {} failed: {}", self.mode(), path, e);
                matrix_error(e.status(), "M_UNKNOWN", e.public_message())
            }
        }
    }
}

impl Downstream for Gateway {
    async fn call(&self, req: Request<Incoming>) -> Response<RelayBody> {
        self.handle(req).await
    }
}

/// Append `path_and_query` to the path of `base`.
fn merge_onto(base: &Url, path_and_query: &str) -> Url {
    let (path, query) = match path_and_query.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (path_and_query, None),
    };

    let mut url = base.clone();
    let joined = format!("{}{}", base.path().trim_end_matches('/'), path);
    url.set_path(&joined);
    url.set_query(query);
    url
}
