//! HTTP surface: catch-all routing, payload limits, exhaustion responses and
//! caller disconnects, all through a real bound listener.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use switchback_proxy::{bind, Provider, Proxy, ProxyOptions, RoutingTable, WireFormat};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn proxy_to(base_url: &str) -> Proxy {
    let provider = Arc::new(Provider::new("p1", WireFormat::Anthropic, base_url, "k"));
    Proxy::new(RoutingTable::new(vec![provider]), ProxyOptions::default()).unwrap()
}

/// Bind an ephemeral port and serve `proxy` in the background.
async fn serve(proxy: Proxy, max_body_bytes: usize) -> String {
    let bound = bind(Arc::new(proxy), "127.0.0.1", 0, max_body_bytes)
        .await
        .unwrap();
    assert_ne!(bound.addr.port(), 0);
    let base_url = bound.base_url();
    tokio::spawn(bound.serve(std::future::pending()));
    base_url
}

#[tokio::test]
async fn test_any_path_is_forwarded() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages/count_tokens"))
        .and(query_param("beta", "true"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("request-id", "req_7")
                .set_body_json(json!({"input_tokens": 42})),
        )
        .expect(1)
        .mount(&upstream)
        .await;

    let base_url = serve(proxy_to(&upstream.uri()), 1 << 20).await;
    let resp = reqwest::Client::new()
        .post(format!("{}/v1/messages/count_tokens?beta=true", base_url))
        .header("content-type", "application/json")
        .body(r#"{"model":"claude-sonnet-4-5","messages":[]}"#)
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["request-id"], "req_7");
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["input_tokens"], 42);
}

#[tokio::test]
async fn test_get_requests_are_forwarded() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": []})))
        .expect(1)
        .mount(&upstream)
        .await;

    let base_url = serve(proxy_to(&upstream.uri()), 1 << 20).await;
    let resp = reqwest::get(format!("{}/v1/models", base_url)).await.unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn test_exhausted_chain_is_bad_gateway() {
    let base_url = serve(proxy_to("http://127.0.0.1:1"), 1 << 20).await;
    let resp = reqwest::Client::new()
        .post(format!("{}/v1/messages", base_url))
        .body(r#"{"model":"m","messages":[]}"#)
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 502);
    assert_eq!(resp.headers()["content-type"], "application/json");
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["failures"][0]["provider"], "p1");
    assert!(body["failures"][0].get("status").is_none());
}

#[tokio::test]
async fn test_oversized_body_is_rejected() {
    let base_url = serve(proxy_to("http://127.0.0.1:1"), 16).await;
    let resp = reqwest::Client::new()
        .post(format!("{}/v1/messages", base_url))
        .body(vec![b'x'; 64])
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 413);
}

#[tokio::test]
async fn test_client_disconnect_cancels_chain_walk() {
    let slow = MockServer::start().await;
    let backup = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_delay(Duration::from_secs(3)))
        .mount(&slow)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .expect(0)
        .mount(&backup)
        .await;

    let p1 = Arc::new(Provider::new("p1", WireFormat::Anthropic, slow.uri(), "k"));
    let p2 = Arc::new(Provider::new("p2", WireFormat::Anthropic, backup.uri(), "k"));
    let proxy = Proxy::new(
        RoutingTable::new(vec![p1.clone(), p2.clone()]),
        ProxyOptions::default(),
    )
    .unwrap();
    let base_url = serve(proxy, 1 << 20).await;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_millis(300))
        .build()
        .unwrap();
    let sent = client
        .post(format!("{}/v1/messages", base_url))
        .json(&json!({"model": "m", "messages": [{"role": "user", "content": "hi"}]}))
        .send()
        .await;
    assert!(sent.is_err());

    // Outlive the slow provider's delay so an uncancelled walk would have
    // penalized p1 and reached p2 by now.
    tokio::time::sleep(Duration::from_secs(4)).await;

    assert_eq!(slow.received_requests().await.unwrap().len(), 1);
    assert!(backup.received_requests().await.unwrap().is_empty());
    assert!(p1.health().healthy);
    assert!(p2.health().healthy);
}
