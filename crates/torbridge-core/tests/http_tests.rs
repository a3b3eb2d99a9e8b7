//! HTTP-over-SOCKS tests against a fake proxy.

mod common;

use common::{FakeLauncher, FakeSocks, FakeTor, FakeTorOptions, SocksMode};
use std::sync::Arc;
use std::time::{Duration, Instant};
use torbridge_core::http::{self, HttpMethod, HttpRequest};
use torbridge_core::{StartTorParams, TorService, TorServiceConfig};

async fn running_service(socks: &FakeSocks) -> (TorService, tempfile::TempDir) {
    let tor = FakeTor::spawn(FakeTorOptions {
        socks_addr: socks.addr,
        ..Default::default()
    })
    .await;
    let launcher = Arc::new(FakeLauncher::new(tor.control_addr));
    let service = TorService::with_launcher(TorServiceConfig::default(), launcher);

    let dir = tempfile::tempdir().expect("tempdir");
    let resp = service
        .start_tor_if_not_running(StartTorParams::new(dir.path(), 0, 8080, 5_000))
        .await;
    assert!(resp.is_success, "{}", resp.error_message);
    assert_eq!(service.socks_address().await, Some(socks.addr));

    (service, dir)
}

#[tokio::test]
async fn test_get_through_service() {
    let socks = FakeSocks::spawn(SocksMode::Http).await;
    let (service, _dir) = running_service(&socks).await;

    let resp = service
        .http_get("http://someservice.onion/status?x=1", r#"{"X-Test": "yes"}"#, 5_000)
        .await;

    assert!(resp.error.is_empty(), "{}", resp.error);
    assert_eq!(resp.status_code, 201);
    assert!(resp.body.starts_with("GET /status?x=1 HTTP/1.1"), "{}", resp.body);
    assert!(resp.body.contains("host=someservice.onion"), "{}", resp.body);
    assert!(resp.body.contains("x-test=yes"), "{}", resp.body);

    // Resolution happens at the proxy.
    assert_eq!(socks.targets(), vec![("someservice.onion".to_string(), 80)]);
}

#[tokio::test]
async fn test_post_put_delete_through_service() {
    let socks = FakeSocks::spawn(SocksMode::Http).await;
    let (service, _dir) = running_service(&socks).await;

    let post = service
        .http_post("http://api.example:8081/items", "{\"a\":1}", "", 5_000)
        .await;
    assert_eq!(post.status_code, 201, "{}", post.error);
    assert!(post.body.starts_with("POST /items"));
    assert!(post.body.contains("host=api.example:8081"));
    assert!(post.body.ends_with("body={\"a\":1}"));

    let put = service.http_put("http://api.example/items/1", "x", "", 5_000).await;
    assert_eq!(put.status_code, 201, "{}", put.error);
    assert!(put.body.starts_with("PUT /items/1"));

    let delete = service.http_delete("http://api.example/items/1", "", 5_000).await;
    assert_eq!(delete.status_code, 201, "{}", delete.error);
    assert!(delete.body.starts_with("DELETE /items/1"));

    assert_eq!(socks.targets()[0], ("api.example".to_string(), 8081));
}

#[tokio::test]
async fn test_malformed_headers_are_ignored() {
    let socks = FakeSocks::spawn(SocksMode::Http).await;
    let (service, _dir) = running_service(&socks).await;

    let resp = service.http_get("http://a.example/", "{not json", 5_000).await;
    assert_eq!(resp.status_code, 201, "{}", resp.error);
    assert!(resp.body.contains("x-test=|"));
}

#[tokio::test]
async fn test_timeout_is_bounded() {
    let socks = FakeSocks::spawn(SocksMode::Silent).await;

    let started = Instant::now();
    let resp = http::send(
        socks.addr,
        &HttpRequest::new(HttpMethod::Get, "http://slow.example/", 300),
    )
    .await;

    assert_eq!(resp.status_code, 0);
    assert_eq!(resp.error, "timeout");
    assert!(resp.body.is_empty());
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_socks_refusal_is_reported() {
    let socks = FakeSocks::spawn(SocksMode::Refuse(0xF6)).await;

    let resp = http::send(
        socks.addr,
        &HttpRequest::new(HttpMethod::Get, "http://bad.onion/", 2_000),
    )
    .await;

    assert_eq!(resp.status_code, 0);
    assert!(resp.error.contains("onion service invalid address"), "{}", resp.error);
}

#[tokio::test]
async fn test_invalid_url_is_reported() {
    let socks = FakeSocks::spawn(SocksMode::Http).await;

    let resp = http::send(
        socks.addr,
        &HttpRequest::new(HttpMethod::Get, "mailto:someone", 2_000),
    )
    .await;

    assert_eq!(resp.status_code, 0);
    assert!(!resp.error.is_empty());
    assert!(socks.targets().is_empty());
}
