use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use reqwest::Client;
use serde_json::json;
use tokio::task::JoinHandle;

use bancada::{app, build_state, AppConfig, CompletionConfig};

const COMPLETIONS_PATH: &str = "/openai/deployments/gpt-5-mini/chat/completions";

#[derive(Clone, Default)]
struct MockUpstream {
    calls: Arc<AtomicUsize>,
    last_body: Arc<Mutex<Option<serde_json::Value>>>,
    reply: Arc<Mutex<(StatusCode, serde_json::Value)>>,
}

impl MockUpstream {
    fn new(status: StatusCode, body: serde_json::Value) -> Self {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
            last_body: Arc::new(Mutex::new(None)),
            reply: Arc::new(Mutex::new((status, body))),
        }
    }
}

async fn complete(
    State(mock): State<MockUpstream>,
    Json(body): Json<serde_json::Value>,
) -> (StatusCode, Json<serde_json::Value>) {
    mock.calls.fetch_add(1, Ordering::SeqCst);
    *mock.last_body.lock().unwrap() = Some(body);
    let (status, reply) = mock.reply.lock().unwrap().clone();
    (status, Json(reply))
}

// Spin up a tiny stand-in for the completion deployment.
async fn start_mock_upstream(mock: MockUpstream) -> (SocketAddr, JoinHandle<()>) {
    let app = Router::new()
        .route(COMPLETIONS_PATH, post(complete))
        .with_state(mock);
    let listener = tokio::net::TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0))
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, handle)
}

fn test_config(upstream: SocketAddr) -> AppConfig {
    AppConfig {
        completion: CompletionConfig {
            endpoint: format!("http://{}", upstream),
            api_key: "test-key".to_string(),
            api_version: "2025-01-01-preview".to_string(),
            model: "gpt-5-mini".to_string(),
            max_completion_tokens: 64,
            timeout_ms: 2000,
        },
        storage: None,
        persona: "Persona de teste.".to_string(),
        max_request_bytes: None,
    }
}

// Helper to spawn an instance of the app bound to an available port.
async fn spawn_app(config: AppConfig) -> (String, JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = app(build_state(config));
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), handle)
}

fn ok_reply(content: &str) -> serde_json::Value {
    json!({ "choices": [ { "message": { "content": content } } ] })
}

#[tokio::test]
async fn analyze_generates_and_sanitizes() {
    let mock = MockUpstream::new(
        StatusCode::OK,
        ok_reply("<think>raciocínio interno</think>\nNaturalmente, isto beneficia Ventura."),
    );
    let (upstream, _uh) = start_mock_upstream(mock.clone()).await;
    let (addr, _h) = spawn_app(test_config(upstream)).await;

    let event = "A EDP subiu os preços da eletricidade em 5%";
    let resp = Client::new()
        .post(format!("{}/api/analyze", addr))
        .json(&json!({ "event": event }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    let analysis = body.get("analysis").and_then(|v| v.as_str()).unwrap();
    assert_eq!(analysis, "Naturalmente, isto beneficia Ventura.");
    assert!(!analysis.contains("<think>"));

    // Exactly one upstream request, with persona and verbatim event.
    assert_eq!(mock.calls.load(Ordering::SeqCst), 1);
    let sent = mock.last_body.lock().unwrap().clone().unwrap();
    let messages = sent.get("messages").and_then(|v| v.as_array()).unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["role"], "system");
    assert_eq!(messages[0]["content"], "Persona de teste.");
    assert!(messages[1]["content"].as_str().unwrap().contains(event));
    assert_eq!(sent.get("max_completion_tokens").unwrap(), &json!(64));
}

#[tokio::test]
async fn analyze_rejects_non_string_event_without_calling_upstream() {
    let mock = MockUpstream::new(StatusCode::OK, ok_reply("nunca usado"));
    let (upstream, _uh) = start_mock_upstream(mock.clone()).await;
    let (addr, _h) = spawn_app(test_config(upstream)).await;

    for body in [
        json!({ "event": 123 }),
        json!({ "event": null }),
        json!({ "event": "" }),
        json!({}),
        json!({ "event": ["lista"] }),
    ] {
        let resp = Client::new()
            .post(format!("{}/api/analyze", addr))
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400, "body {:?} must be rejected", body);
        let err: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(err.get("error").unwrap(), "Event is required");
    }
    assert_eq!(mock.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn analyze_rejects_malformed_json_body() {
    let mock = MockUpstream::new(StatusCode::OK, ok_reply("nunca usado"));
    let (upstream, _uh) = start_mock_upstream(mock.clone()).await;
    let (addr, _h) = spawn_app(test_config(upstream)).await;

    let resp = Client::new()
        .post(format!("{}/api/analyze", addr))
        .header("content-type", "application/json")
        .body("{ not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let err: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(err.get("error").unwrap(), "Event is required");
    assert_eq!(mock.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn upstream_failure_maps_to_generic_500() {
    let upstream_detail = "deployment quota exceeded, contact subscription owner";
    let mock = MockUpstream::new(
        StatusCode::SERVICE_UNAVAILABLE,
        json!({ "error": upstream_detail }),
    );
    let (upstream, _uh) = start_mock_upstream(mock).await;
    let (addr, _h) = spawn_app(test_config(upstream)).await;

    let resp = Client::new()
        .post(format!("{}/api/analyze", addr))
        .json(&json!({ "event": "algo aconteceu" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 500);
    let text = resp.text().await.unwrap();
    assert!(text.contains("Failed to generate analysis"));
    // The raw upstream error must stay server-side.
    assert!(!text.contains(upstream_detail));
}

#[tokio::test]
async fn unreachable_upstream_maps_to_generic_500() {
    // No listener behind this port; transport errors follow the same path.
    let dead: SocketAddr = "127.0.0.1:1".parse().unwrap();
    let mut config = test_config(dead);
    config.completion.timeout_ms = 200;
    let (addr, _h) = spawn_app(config).await;

    let resp = Client::new()
        .post(format!("{}/api/analyze", addr))
        .json(&json!({ "event": "algo aconteceu" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 500);
}

#[tokio::test]
async fn missing_candidate_falls_back_to_placeholder() {
    let mock = MockUpstream::new(StatusCode::OK, json!({ "choices": [] }));
    let (upstream, _uh) = start_mock_upstream(mock).await;
    let (addr, _h) = spawn_app(test_config(upstream)).await;

    let resp = Client::new()
        .post(format!("{}/api/analyze", addr))
        .json(&json!({ "event": "algo aconteceu" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(
        body.get("analysis").unwrap(),
        bancada::ANALYSIS_UNAVAILABLE
    );
}

#[tokio::test]
async fn recent_is_empty_without_storage_and_generation_still_works() {
    let mock = MockUpstream::new(StatusCode::OK, ok_reply("Análise gerada."));
    let (upstream, _uh) = start_mock_upstream(mock).await;
    let (addr, _h) = spawn_app(test_config(upstream)).await;

    let resp = Client::new()
        .get(format!("{}/api/recent", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body.get("analyses").unwrap(), &json!([]));

    let resp = Client::new()
        .post(format!("{}/api/analyze", addr))
        .json(&json!({ "event": "algo aconteceu" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn healthz_reports_archive_state() {
    let mock = MockUpstream::new(StatusCode::OK, ok_reply("x"));
    let (upstream, _uh) = start_mock_upstream(mock).await;
    let (addr, _h) = spawn_app(test_config(upstream)).await;

    let resp = Client::new()
        .get(format!("{}/healthz", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body.get("status").unwrap(), "ok");
    assert_eq!(body.get("archiveEnabled").unwrap(), &json!(false));
}

#[tokio::test]
async fn metrics_counts_requests_and_failures() {
    let mock = MockUpstream::new(StatusCode::OK, ok_reply("Análise."));
    let (upstream, _uh) = start_mock_upstream(mock).await;
    let (addr, _h) = spawn_app(test_config(upstream)).await;
    let client = Client::new();

    client
        .post(format!("{}/api/analyze", addr))
        .json(&json!({ "event": "ok" }))
        .send()
        .await
        .unwrap();
    client
        .post(format!("{}/api/analyze", addr))
        .json(&json!({ "event": 5 }))
        .send()
        .await
        .unwrap();

    let text = client
        .get(format!("{}/metrics", addr))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(text.contains("bancada_requests_total 2"));
    assert!(text.contains("bancada_validation_failures_total 1"));
    assert!(text.contains("bancada_generate_ms_count 1"));
}

#[tokio::test]
async fn request_body_limit_is_enforced() {
    let mock = MockUpstream::new(StatusCode::OK, ok_reply("x"));
    let (upstream, _uh) = start_mock_upstream(mock.clone()).await;
    let mut config = test_config(upstream);
    config.max_request_bytes = Some(64);
    let (addr, _h) = spawn_app(config).await;

    let big_event = "a".repeat(1024);
    let resp = Client::new()
        .post(format!("{}/api/analyze", addr))
        .json(&json!({ "event": big_event }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    assert_eq!(mock.calls.load(Ordering::SeqCst), 0);
}
