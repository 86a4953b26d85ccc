mod common;

use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Request, Response};
use tim_gateway::config::{Config, RelayConfig};
use tim_gateway::federation::FederationAllowList;
use tim_gateway::proxy::{Gateway, PlainHandler, RelayEngine};
use tim_gateway::telemetry::AuditLogger;
use tokio::net::TcpListener;

const MEMBER_AUTH: &str =
    r#"X-Matrix origin="a.example.org",destination="hs.example.org",key="ed25519:1",sig="c2ln""#;
const STRANGER_AUTH: &str =
    r#"X-Matrix origin="evil.example.org",destination="hs.example.org",key="ed25519:1",sig="c2ln""#;

/// Homeserver stand-in echoing the path and query it was asked for.
async fn spawn_homeserver() -> std::net::SocketAddr {
    common::spawn_http(|req: Request<Incoming>| async move {
        let target = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_default();
        Response::new(Full::new(Bytes::from(target)))
    })
    .await
}

async fn inbound_gateway(homeserver_url: String, enforce: bool) -> common::RunningGateway {
    let mut config = Config::default();
    config.inbound.homeserver_url = homeserver_url;
    config.inbound.enforce_domain_list = enforce;

    let relay = Arc::new(RelayEngine::new(&RelayConfig::default(), &[]).expect("relay"));
    let gateway = Gateway::inbound(
        &config,
        FederationAllowList::from_domains(["a.example.org"]),
        relay,
        Arc::new(AuditLogger::new_null()),
    )
    .expect("inbound gateway");

    common::spawn_gateway("inbound", Arc::new(PlainHandler::new(Arc::new(gateway)))).await
}

fn client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().expect("client")
}

#[tokio::test]
async fn test_member_origin_is_relayed_to_homeserver() {
    let homeserver = spawn_homeserver().await;
    let gateway = inbound_gateway(format!("http://{}/base", homeserver), true).await;

    let response = client()
        .put(format!("http://{}/_matrix/federation/v1/send/1?x=1", gateway.addr))
        .header("authorization", MEMBER_AUTH)
        .body("{}")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(
        response.text().await.unwrap(),
        "/base/_matrix/federation/v1/send/1?x=1"
    );
}

#[tokio::test]
async fn test_stranger_origin_is_denied() {
    let homeserver = spawn_homeserver().await;
    let gateway = inbound_gateway(format!("http://{}", homeserver), true).await;

    let response = client()
        .get(format!("http://{}/_matrix/federation/v1/version", gateway.addr))
        .header("authorization", STRANGER_AUTH)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);
    let body: serde_json::Value = serde_json::from_str(&response.text().await.unwrap()).unwrap();
    assert_eq!(body["errcode"], "M_UNAUTHORIZED");
    assert_eq!(body["error"], "not part of federation");
}

#[tokio::test]
async fn test_missing_authorization_is_denied() {
    let homeserver = spawn_homeserver().await;
    let gateway = inbound_gateway(format!("http://{}", homeserver), true).await;

    let response = client()
        .get(format!("http://{}/_matrix/key/v2/server", gateway.addr))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);
    let body: serde_json::Value = serde_json::from_str(&response.text().await.unwrap()).unwrap();
    assert_eq!(
        body["error"],
        "missing X-Matrix authorization header with origin field"
    );
}

#[tokio::test]
async fn test_ungated_path_skips_federation_check() {
    let homeserver = spawn_homeserver().await;
    let gateway = inbound_gateway(format!("http://{}", homeserver), true).await;

    let response = client()
        .get(format!("http://{}/_matrix/client/versions", gateway.addr))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "/_matrix/client/versions");
}

#[tokio::test]
async fn test_not_enforced_lets_strangers_through() {
    let homeserver = spawn_homeserver().await;
    let gateway = inbound_gateway(format!("http://{}", homeserver), false).await;

    let response = client()
        .get(format!("http://{}/_matrix/federation/v1/version", gateway.addr))
        .header("authorization", STRANGER_AUTH)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::OK);
}

#[tokio::test]
async fn test_unreachable_homeserver_is_bad_gateway() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead = listener.local_addr().unwrap();
    drop(listener);
    let gateway = inbound_gateway(format!("http://{}", dead), true).await;

    let response = client()
        .get(format!("http://{}/_matrix/federation/v1/version", gateway.addr))
        .header("authorization", MEMBER_AUTH)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::BAD_GATEWAY);
    let body: serde_json::Value = serde_json::from_str(&response.text().await.unwrap()).unwrap();
    assert_eq!(body["errcode"], "M_UNKNOWN");
    assert_eq!(body["error"], "bad gateway");
}

#[tokio::test]
async fn test_inbound_unhandled_path_not_found() {
    let homeserver = spawn_homeserver().await;
    let gateway = inbound_gateway(format!("http://{}", homeserver), true).await;

    let response = client()
        .get(format!("http://{}/_synapse/admin/v1/users", gateway.addr))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    let body: serde_json::Value = serde_json::from_str(&response.text().await.unwrap()).unwrap();
    assert_eq!(body["errcode"], "M_NOT_FOUND");
}

async fn outbound_gateway(sso_domain: Option<String>) -> common::RunningGateway {
    let mut config = Config::default();
    config.outbound.upstream_scheme = "http".to_string();
    config.outbound.sso_domain = sso_domain;

    let relay = Arc::new(RelayEngine::new(&RelayConfig::default(), &[]).expect("relay"));
    let gateway = Gateway::outbound(
        &config,
        FederationAllowList::from_domains(["a.example.org"]),
        relay,
        Arc::new(AuditLogger::new_null()),
    );

    common::spawn_gateway("outbound", Arc::new(PlainHandler::new(Arc::new(gateway)))).await
}

/// Send `path` through the outbound gateway with `Host` naming `destination`.
async fn outbound_get(
    gateway: &common::RunningGateway,
    destination: std::net::SocketAddr,
    path: &str,
) -> (reqwest::StatusCode, String) {
    let mut stream = tokio::net::TcpStream::connect(gateway.addr).await.unwrap();
    let request = format!(
        "GET {path} HTTP/1.1\r\nHost: {destination}\r\nConnection: close\r\n\r\n"
    );
    tokio::io::AsyncWriteExt::write_all(&mut stream, request.as_bytes())
        .await
        .unwrap();
    let mut raw = String::new();
    tokio::io::AsyncReadExt::read_to_string(&mut stream, &mut raw)
        .await
        .unwrap();

    let status: u16 = raw
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .expect("status line");
    let body = raw.split_once("\r\n\r\n").map(|(_, b)| b.to_string()).unwrap_or_default();
    (reqwest::StatusCode::from_u16(status).unwrap(), body)
}

#[tokio::test]
async fn test_outbound_unhandled_path_to_stranger_not_relayed() {
    let destination = spawn_homeserver().await;
    let gateway = outbound_gateway(None).await;

    let (status, body) = outbound_get(&gateway, destination, "/_matrix/client/v3/profile/x").await;

    assert_eq!(status, reqwest::StatusCode::NOT_FOUND);
    assert!(body.contains("M_NOT_FOUND"), "unexpected body: {}", body);
    assert!(!body.contains("/_matrix/client"));
}

#[tokio::test]
async fn test_outbound_pass_through_path_relayed() {
    let destination = spawn_homeserver().await;
    let gateway = outbound_gateway(None).await;

    let (status, body) = outbound_get(&gateway, destination, "/_matrix/push/v1/notify").await;

    assert_eq!(status, reqwest::StatusCode::OK);
    assert!(body.contains("/_matrix/push/v1/notify"), "unexpected body: {}", body);
}

#[tokio::test]
async fn test_outbound_sso_host_reachable_on_any_path() {
    let destination = spawn_homeserver().await;
    let gateway = outbound_gateway(Some("http://127.0.0.1/".to_string())).await;

    let (status, body) = outbound_get(&gateway, destination, "/login/sso/redirect").await;

    assert_eq!(status, reqwest::StatusCode::OK);
    assert!(body.contains("/login/sso/redirect"), "unexpected body: {}", body);
}
