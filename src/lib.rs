//! Core library for Bancada. Wires the prompt builder, completion client,
//! response sanitizer and archive together behind two HTTP endpoints:
//! `POST /api/analyze` generates a satirical commentary for a news event and
//! `GET /api/recent` lists the latest archived pairs.

mod completion;
mod config;
pub mod prompt;
pub mod sanitize;
pub mod storage;

pub use completion::{CompletionClient, CompletionError, ANALYSIS_UNAVAILABLE};
pub use config::{AppConfig, CompletionConfig, StorageConfig};
pub use storage::{AnalysisRecord, Archive};

use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::prompt::build_messages;
use crate::sanitize::strip_reasoning;

/// Fixed error bodies. Validation is the only client-visible detailed error;
/// everything else collapses to the generic message so upstream diagnostics
/// never leak.
const EVENT_REQUIRED: &str = "Event is required";
const GENERATION_FAILED: &str = "Failed to generate analysis";

/// How many archived entries the recent endpoint returns at most.
const RECENT_LIMIT: usize = 10;

#[derive(Debug, Deserialize, Default)]
pub struct AnalyzeRequest {
    /// Kept as a raw JSON value so a non-string `event` (e.g. a number) is a
    /// validation failure, not a deserialisation rejection.
    #[serde(default)]
    pub event: Option<serde_json::Value>,
}

impl AnalyzeRequest {
    fn event_text(&self) -> Option<&str> {
        self.event
            .as_ref()
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Serialize)]
pub struct AnalyzeResponse {
    pub analysis: String,
}

#[derive(Debug, Serialize)]
pub struct RecentResponse {
    pub analyses: Vec<AnalysisRecord>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Internal application state shared across handlers. Built once at startup;
/// read-only afterwards apart from the metric counters.
#[derive(Clone)]
pub struct AppState {
    pub completion: CompletionClient,
    pub archive: Archive,
    pub persona: Arc<str>,
    pub max_request_bytes: Option<usize>,
    pub metric_requests_total: Arc<AtomicU64>,
    pub metric_validation_failures_total: Arc<AtomicU64>,
    pub metric_generate_failures_total: Arc<AtomicU64>,
    pub metric_generate_ms_sum: Arc<AtomicU64>,
    pub metric_generate_count: Arc<AtomicU64>,
}

/// Build state from a parsed configuration. Kept separate from
/// [`build_state_from_env`] so tests can construct configs directly.
pub fn build_state(config: AppConfig) -> AppState {
    AppState {
        completion: CompletionClient::new(&config.completion),
        archive: Archive::from_config(config.storage.as_ref()),
        persona: Arc::from(config.persona.as_str()),
        max_request_bytes: config.max_request_bytes,
        metric_requests_total: Arc::new(AtomicU64::new(0)),
        metric_validation_failures_total: Arc::new(AtomicU64::new(0)),
        metric_generate_failures_total: Arc::new(AtomicU64::new(0)),
        metric_generate_ms_sum: Arc::new(AtomicU64::new(0)),
        metric_generate_count: Arc::new(AtomicU64::new(0)),
    }
}

pub fn build_state_from_env() -> anyhow::Result<AppState> {
    Ok(build_state(AppConfig::from_env()?))
}

/// Build the Axum router and attach handlers.
pub fn app(state: AppState) -> Router {
    let max_request_bytes = state.max_request_bytes;

    let router = Router::new()
        .route("/api/analyze", post(analyze_handler))
        .route("/api/recent", get(recent_handler))
        .route("/healthz", get(healthz_handler))
        .route("/metrics", get(metrics_handler));

    let router = if let Some(limit) = max_request_bytes {
        router.layer(DefaultBodyLimit::max(limit))
    } else {
        router
    };

    router.with_state(state)
}

fn bad_request() -> axum::response::Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: EVENT_REQUIRED.to_string(),
        }),
    )
        .into_response()
}

async fn analyze_handler(
    State(state): State<AppState>,
    payload: Result<Json<AnalyzeRequest>, JsonRejection>,
) -> axum::response::Response {
    state.metric_requests_total.fetch_add(1, Ordering::Relaxed);

    // Malformed JSON bodies and shape mismatches get the same fixed 400 as a
    // missing event; the upstream call must not happen for any of them.
    let request = match payload {
        Ok(Json(inner)) => inner,
        Err(rejection) => {
            tracing::debug!(error=%rejection, "rejected analyze request body");
            state
                .metric_validation_failures_total
                .fetch_add(1, Ordering::Relaxed);
            return bad_request();
        }
    };
    let Some(event) = request.event_text() else {
        state
            .metric_validation_failures_total
            .fetch_add(1, Ordering::Relaxed);
        return bad_request();
    };

    let messages = build_messages(&state.persona, event);
    let start = Instant::now();
    let raw = match state.completion.generate(&messages).await {
        Ok(raw) => raw,
        Err(err) => {
            match &err {
                CompletionError::Status { status, body } => {
                    tracing::error!(status, body=%body, "completion endpoint error");
                }
                CompletionError::Transport(_) => {
                    tracing::error!(error=%err, "completion request failed");
                }
            }
            state
                .metric_generate_failures_total
                .fetch_add(1, Ordering::Relaxed);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: GENERATION_FAILED.to_string(),
                }),
            )
                .into_response();
        }
    };
    let latency_ms = start.elapsed().as_millis() as u64;
    state
        .metric_generate_ms_sum
        .fetch_add(latency_ms, Ordering::Relaxed);
    state.metric_generate_count.fetch_add(1, Ordering::Relaxed);

    let analysis = strip_reasoning(&raw);

    // Fire and forget: the response never waits on storage, and a failed write
    // is logged inside the task.
    {
        let archive = state.archive.clone();
        let event = event.to_string();
        let analysis = analysis.clone();
        tokio::spawn(async move {
            archive.record(&event, &analysis).await;
        });
    }

    (StatusCode::OK, Json(AnalyzeResponse { analysis })).into_response()
}

/// Always 200: a broken or absent archive degrades to an empty list.
async fn recent_handler(State(state): State<AppState>) -> axum::response::Response {
    let analyses = state.archive.recent(RECENT_LIMIT).await;
    (StatusCode::OK, Json(RecentResponse { analyses })).into_response()
}

/// Simple health endpoint for container readiness / liveness checks.
async fn healthz_handler(State(state): State<AppState>) -> axum::response::Response {
    let json = serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "archiveEnabled": state.archive.is_enabled(),
    });
    (StatusCode::OK, Json(json)).into_response()
}

/// Prometheus-style metrics exposition. Text format with simple counters.
async fn metrics_handler(State(state): State<AppState>) -> axum::response::Response {
    use std::fmt::Write as _;
    let mut buf = String::new();
    let requests = state.metric_requests_total.load(Ordering::Relaxed);
    let invalid = state
        .metric_validation_failures_total
        .load(Ordering::Relaxed);
    let failures = state.metric_generate_failures_total.load(Ordering::Relaxed);
    let gen_sum = state.metric_generate_ms_sum.load(Ordering::Relaxed);
    let gen_count = state.metric_generate_count.load(Ordering::Relaxed);
    writeln!(
        &mut buf,
        "# HELP bancada_requests_total Total analyze requests received"
    )
    .ok();
    writeln!(&mut buf, "# TYPE bancada_requests_total counter").ok();
    writeln!(&mut buf, "bancada_requests_total {}", requests).ok();
    writeln!(
        &mut buf,
        "# HELP bancada_validation_failures_total Analyze requests rejected with 400"
    )
    .ok();
    writeln!(&mut buf, "# TYPE bancada_validation_failures_total counter").ok();
    writeln!(&mut buf, "bancada_validation_failures_total {}", invalid).ok();
    writeln!(
        &mut buf,
        "# HELP bancada_generate_failures_total Upstream generation failures"
    )
    .ok();
    writeln!(&mut buf, "# TYPE bancada_generate_failures_total counter").ok();
    writeln!(&mut buf, "bancada_generate_failures_total {}", failures).ok();
    writeln!(
        &mut buf,
        "# HELP bancada_generate_ms_sum Cumulative upstream generation latency (ms)"
    )
    .ok();
    writeln!(&mut buf, "# TYPE bancada_generate_ms_sum counter").ok();
    writeln!(&mut buf, "bancada_generate_ms_sum {}", gen_sum).ok();
    writeln!(
        &mut buf,
        "# HELP bancada_generate_ms_count Successful upstream generations"
    )
    .ok();
    writeln!(&mut buf, "# TYPE bancada_generate_ms_count counter").ok();
    writeln!(&mut buf, "bancada_generate_ms_count {}", gen_count).ok();
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4",
        )],
        buf,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_text_requires_non_empty_string() {
        let req = AnalyzeRequest { event: None };
        assert!(req.event_text().is_none());
        let req = AnalyzeRequest {
            event: Some(serde_json::json!(123)),
        };
        assert!(req.event_text().is_none());
        let req = AnalyzeRequest {
            event: Some(serde_json::json!("")),
        };
        assert!(req.event_text().is_none());
        let req = AnalyzeRequest {
            event: Some(serde_json::json!("algo aconteceu")),
        };
        assert_eq!(req.event_text(), Some("algo aconteceu"));
    }
}
