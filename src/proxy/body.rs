//! Response bodies and canned responses shared by the gateways.

use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::header::{CONNECTION, CONTENT_TYPE, HeaderValue};
use hyper::{Response, StatusCode};

/// Boxed error carried by relayed bodies.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type of every response the gateways produce.
pub type RelayBody = UnsyncBoxBody<Bytes, BoxError>;

/// Create an empty response body.
pub fn empty_body() -> RelayBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Create a response body with content.
pub fn full_body(content: impl Into<Bytes>) -> RelayBody {
    Full::new(content.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// A response with only a status and the given body.
pub fn response_with(status: StatusCode, body: RelayBody) -> Response<RelayBody> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
}

/// A `text/plain` response that also closes the connection.
pub fn closing_text_response(status: StatusCode, message: &str) -> Response<RelayBody> {
    let mut response = response_with(status, full_body(message.to_string()));
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    headers.insert(CONNECTION, HeaderValue::from_static("close"));
    response
}

/// A Matrix-style JSON error: `{"errcode": ..., "error": ...}`.
pub fn matrix_error(status: StatusCode, errcode: &str, message: &str) -> Response<RelayBody> {
    let body = serde_json::json!({ "errcode": errcode, "error": message }).to_string();
    let mut response = response_with(status, full_body(body));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}
