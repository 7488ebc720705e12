//! Streaming (HTTP pass-through) call path against a mock downstream.

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use codemux_error::DispatchError;
use codemux_proxy::{
    AccessControlledInvoker, CallerIdentity, Connection, GrantPolicy, InvokerMetrics,
    ProxyCollection, ProxyContext, TransportConfig,
};
use common::FlakyFactory;
use futures::StreamExt;
use mockito::Matcher;
use prometheus_client::registry::Registry;
use serde_json::json;

struct Fixture {
    invoker: AccessControlledInvoker,
    metrics: Arc<InvokerMetrics>,
}

async fn fixture(base_url: &str) -> Fixture {
    let mut api = Connection::http("api", base_url);
    api.bearer_token = Some("secret-token".into());
    api.transport = TransportConfig::Http {
        url: base_url.to_string(),
        headers: HashMap::from([("X-Tenant".to_string(), "acme".to_string())]),
    };
    api.tools = vec!["search".into()];

    let mut nested = Connection::http("nested", base_url);
    nested.is_virtual = true;
    let local = Connection::stdio("local", "local-server", vec![]);

    let ctx = ProxyContext::new("node", Arc::new(FlakyFactory::default()));
    let collection = Arc::new(ProxyCollection::create(vec![api, nested, local], &ctx).await);

    let mut registry = Registry::default();
    let metrics = Arc::new(InvokerMetrics::new(&mut registry));
    let invoker = AccessControlledInvoker::new(
        collection,
        Arc::new(GrantPolicy::new().grant("alice", "*")),
    )
    .unwrap()
    .with_metrics(metrics.clone());
    Fixture { invoker, metrics }
}

#[tokio::test]
async fn denied_call_never_touches_the_network() {
    let mut server = mockito::Server::new_async().await;
    let downstream = server
        .mock("POST", Matcher::Any)
        .expect(0)
        .create_async()
        .await;
    let fx = fixture(&server.url()).await;

    let response = fx
        .invoker
        .call_tool_streaming(
            &CallerIdentity::principal("mallory"),
            "api",
            "search",
            json!({"q": "x"}),
        )
        .await
        .unwrap();

    assert_eq!(response.status.as_u16(), 403);
    let body = response.json().await.unwrap();
    assert!(
        body["error"]
            .as_str()
            .unwrap()
            .starts_with("Authorization failed: "),
        "{body}"
    );
    downstream.assert_async().await;
    assert_eq!(fx.metrics.calls("api", "search", false), 1);
}

#[tokio::test]
async fn allowed_call_is_forwarded_with_merged_headers_and_sanitized_body() {
    let mut server = mockito::Server::new_async().await;
    let downstream = server
        .mock("POST", "/call-tool/search")
        .match_header("authorization", "Bearer secret-token")
        .match_header("x-tenant", "acme")
        .match_header("content-type", "application/json")
        .match_body(Matcher::Json(json!({"q": "rust"})))
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body("data: one\n\ndata: two\n\n")
        .expect(1)
        .create_async()
        .await;
    let fx = fixture(&server.url()).await;

    let response = fx
        .invoker
        .call_tool_streaming(
            &CallerIdentity::principal("alice"),
            "api",
            "search",
            json!({"q": "rust", "signal": {}}),
        )
        .await
        .unwrap();

    assert!(response.is_success());
    assert_eq!(response.headers["content-type"], "text/event-stream");
    let chunks: Vec<_> = response.into_stream().collect().await;
    let body: Vec<u8> = chunks
        .into_iter()
        .flat_map(|c| c.unwrap().to_vec())
        .collect();
    assert_eq!(body, b"data: one\n\ndata: two\n\n");

    downstream.assert_async().await;
    assert_eq!(fx.metrics.calls("api", "search", true), 1);
}

#[tokio::test]
async fn redirects_are_returned_not_followed() {
    let mut server = mockito::Server::new_async().await;
    let redirect = server
        .mock("POST", "/call-tool/search")
        .with_status(302)
        .with_header("location", "/elsewhere")
        .expect(1)
        .create_async()
        .await;
    let elsewhere = server
        .mock("GET", "/elsewhere")
        .expect(0)
        .create_async()
        .await;
    let fx = fixture(&server.url()).await;

    let response = fx
        .invoker
        .call_tool_streaming(&CallerIdentity::principal("alice"), "api", "search", json!({}))
        .await
        .unwrap();

    assert_eq!(response.status.as_u16(), 302);
    assert_eq!(response.headers["location"], "/elsewhere");
    redirect.assert_async().await;
    elsewhere.assert_async().await;
    assert_eq!(fx.metrics.calls("api", "search", false), 1);
}

#[tokio::test]
async fn upstream_error_status_is_passed_through_and_counted() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/call-tool/search")
        .with_status(500)
        .with_body("{\"error\":\"down\"}")
        .create_async()
        .await;
    let fx = fixture(&server.url()).await;

    let response = fx
        .invoker
        .call_tool_streaming(&CallerIdentity::principal("alice"), "api", "search", json!({}))
        .await
        .unwrap();

    assert_eq!(response.status.as_u16(), 500);
    assert_eq!(response.json().await.unwrap(), json!({"error": "down"}));
    assert_eq!(fx.metrics.calls("api", "search", false), 1);
}

#[tokio::test]
async fn unreachable_downstream_is_a_transport_error() {
    // Nothing listens on port 9 of the loopback interface.
    let fx = fixture("http://127.0.0.1:9").await;
    let err = fx
        .invoker
        .call_tool_streaming(&CallerIdentity::principal("alice"), "api", "search", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::Transport { .. }), "{err:?}");
    assert!(err.retryable());
}

#[tokio::test]
async fn only_plain_http_connections_stream() {
    let fx = fixture("http://127.0.0.1:9").await;
    let alice = CallerIdentity::principal("alice");
    for connection in ["nested", "local"] {
        let err = fx
            .invoker
            .call_tool_streaming(&alice, connection, "search", json!({}))
            .await
            .unwrap_err();
        assert!(
            matches!(err, DispatchError::StreamingUnsupported { .. }),
            "{connection}: {err:?}"
        );
    }
}
