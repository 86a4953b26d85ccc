//! Request/response relay between a client connection and a destination.
//!
//! The relay copies method, filtered headers and body of an incoming request
//! to a new outbound request, sends it, and turns the destination's answer
//! into a response for the original caller.
//!
//! # Body handling
//!
//! - **Buffered**: bodies are collected once and written once. Used for the
//!   small JSON documents of the federation API. The whole exchange runs
//!   under the configured request timeout.
//! - **Streaming**: bytes flow chunk by chunk in both directions; at most a
//!   few chunks are held at any time, whatever the payload size. Used for
//!   media and whenever the destination answers with chunked encoding.
//!
//! A buffered request that arrives with `Transfer-Encoding: chunked` is
//! forwarded without its body.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::TryStreamExt;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Body, Frame};
use hyper::header::{CONNECTION, HeaderMap, TRANSFER_ENCODING};
use hyper::{Method, Request, Response};
use reqwest::Url;
use rustls_pki_types::CertificateDer;
use tracing::{debug, trace, warn};

use super::body::{BoxError, RelayBody, full_body};
use super::error::{ProxyError, RelayError};
use super::tls::create_tls_connector;
use crate::config::RelayConfig;

/// Hop-by-hop headers (RFC 9110 section 7.6.1) plus legacy proxy headers.
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Headers recomputed by the outbound client from what it actually sends.
const RECOMPUTED: [&str; 2] = ["content-length", "host"];

/// How bodies are moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayMode {
    /// Read fully, then write once.
    Buffered,
    /// Copy chunk by chunk without materializing the payload.
    Streaming,
}

/// What happened to the request body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardedBody {
    /// Sent in one piece of this many bytes.
    Buffered(usize),
    /// Streamed; the size is not known up front.
    Streamed,
    /// Dropped because a buffered relay cannot take a chunked body.
    DroppedChunked,
}

/// The request as it was sent to the destination.
#[derive(Debug, Clone)]
pub struct ForwardedRequest {
    /// Request method.
    pub method: Method,
    /// Destination URL.
    pub url: Url,
    /// Headers after filtering.
    pub headers: HeaderMap,
    /// Body handling.
    pub body: ForwardedBody,
}

/// Running count of response body bytes handed to the caller.
///
/// For streamed responses the count grows while the body is consumed.
#[derive(Debug, Clone, Default)]
pub struct ByteCounter(Arc<AtomicU64>);

impl ByteCounter {
    fn add(&self, n: usize) {
        self.0.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Bytes counted so far.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Result of one relayed exchange.
#[derive(Debug)]
pub struct Relayed {
    /// What was sent.
    pub request: ForwardedRequest,
    /// Response for the original caller.
    pub response: Response<RelayBody>,
    /// Time until the response head (and, when buffered, body) arrived.
    pub elapsed: Duration,
    /// Response body bytes.
    pub response_bytes: ByteCounter,
}

/// Stateless forwarder shared by both gateways.
#[derive(Debug, Clone)]
pub struct RelayEngine {
    client: reqwest::Client,
    request_timeout: Duration,
}

impl RelayEngine {
    /// Build the outbound client.
    ///
    /// Destinations are verified against the system roots plus `extra_roots`.
    /// Redirects are passed back to the caller, never followed.
    pub fn new(
        config: &RelayConfig,
        extra_roots: &[CertificateDer<'static>],
    ) -> Result<Self, ProxyError> {
        let tls = create_tls_connector(extra_roots)?;
        let client = reqwest::Client::builder()
            .use_preconfigured_tls(tls)
            .connect_timeout(config.connect_timeout())
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()
            .map_err(|e| ProxyError::Tls(format!("Failed to build relay client: {}", e)))?;

        Ok(Self {
            client,
            request_timeout: config.request_timeout(),
        })
    }

    /// Forward `req` to `url` and relay the answer.
    pub async fn forward<B>(
        &self,
        req: Request<B>,
        url: Url,
        mode: RelayMode,
    ) -> Result<Relayed, RelayError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let started = Instant::now();
        let (parts, body) = req.into_parts();
        let headers = filter_unsafe_headers(&parts.headers);

        let mut builder = self
            .client
            .request(parts.method.clone(), url.clone())
            .headers(headers.clone());

        let forwarded_body = match mode {
            RelayMode::Streaming => {
                builder = builder.body(reqwest::Body::wrap_stream(body.into_data_stream()));
                ForwardedBody::Streamed
            }
            RelayMode::Buffered if is_chunked(&parts.headers) => {
                warn!(
                    "{} {}: body is empty because of chunked transfer encoding",
                    parts.method, url
                );
                ForwardedBody::DroppedChunked
            }
            RelayMode::Buffered => {
                let bytes = body
                    .collect()
                    .await
                    .map_err(|e| {
                        let e: BoxError = e.into();
                        RelayError::Upstream(format!("failed to read request body: {}", e))
                    })?
                    .to_bytes();
                let len = bytes.len();
                if len > 0 {
                    builder = builder.body(bytes);
                }
                ForwardedBody::Buffered(len)
            }
        };

        let request = ForwardedRequest {
            method: parts.method,
            url,
            headers,
            body: forwarded_body,
        };
        trace!("Relaying {} {} ({:?})", request.method, request.url, mode);

        let response_bytes = ByteCounter::default();
        let exchange = exchange(builder, mode, response_bytes.clone());
        let response = match mode {
            RelayMode::Buffered => tokio::time::timeout(self.request_timeout, exchange)
                .await
                .map_err(|_| RelayError::Timeout)??,
            RelayMode::Streaming => exchange.await?,
        };

        let elapsed = started.elapsed();
        debug!(
            "{} {} -> {} in {}ms",
            request.method,
            request.url,
            response.status(),
            elapsed.as_millis()
        );

        Ok(Relayed {
            request,
            response,
            elapsed,
            response_bytes,
        })
    }
}

/// Send the request and turn the destination's answer into a response.
async fn exchange(
    builder: reqwest::RequestBuilder,
    mode: RelayMode,
    counter: ByteCounter,
) -> Result<Response<RelayBody>, RelayError> {
    let upstream = builder.send().await.map_err(RelayError::from_reqwest)?;

    let status = upstream.status();
    let headers = filter_unsafe_headers(upstream.headers());

    let body = if mode == RelayMode::Streaming || is_chunked(upstream.headers()) {
        let counter = counter.clone();
        let frames = upstream
            .bytes_stream()
            .map_ok(move |chunk| {
                counter.add(chunk.len());
                Frame::data(chunk)
            })
            .map_err(|e| Box::new(e) as BoxError);
        StreamBody::new(frames).boxed_unsync()
    } else {
        let bytes = upstream.bytes().await.map_err(RelayError::from_reqwest)?;
        counter.add(bytes.len());
        full_body(bytes)
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}

/// Copy `headers` without hop-by-hop and recomputed headers.
///
/// Headers listed in `Connection` are hop-by-hop too and are dropped.
pub fn filter_unsafe_headers(headers: &HeaderMap) -> HeaderMap {
    let listed: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    let mut filtered = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name_str = name.as_str();
        if HOP_BY_HOP.contains(&name_str)
            || RECOMPUTED.contains(&name_str)
            || listed.iter().any(|l| l == name_str)
        {
            continue;
        }
        filtered.append(name.clone(), value.clone());
    }
    filtered
}

/// Whether the message body uses chunked transfer coding.
pub fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get_all(TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
}
