//! HTTP router and handlers
//!
//! The Anthropic-compatible front surface: `POST /v1/messages` plus the
//! health, status, stats, reset, and shutdown endpoints.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Path, State},
    http::{HeaderMap, StatusCode, header::HeaderName},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::{Value, json};
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{info, warn};

use super::streaming::{sse_error_response, sse_response};
use crate::config::Config;
use crate::error::Error;
use crate::flow::{FlowController, RequestIds, generate_request_id};
use crate::pipeline::{PipelineAssembler, PipelineStatus};
use crate::protocol::messages::CanonicalRequest;
use crate::routing::RoutingTable;
use crate::stats::UsageStats;
use crate::switching::SwitchingController;
use crate::transform::simulate_stream;
use crate::upstream::HttpExecutor;

/// Shared application state.
pub struct AppState {
    /// Flow controller (sessions, conversations, queues)
    pub flow: Arc<FlowController>,
    /// Pipeline owner
    pub assembler: Arc<PipelineAssembler>,
    /// Health-record owner
    pub switching: Arc<SwitchingController>,
    /// Outbound executor (key rings)
    pub executor: Arc<HttpExecutor>,
    /// Usage counters
    pub stats: Arc<UsageStats>,
    /// Validated routing table
    pub table: Arc<RoutingTable>,
    /// Loaded configuration
    pub config: Config,
    /// Shutdown broadcast
    pub shutdown_tx: tokio::sync::broadcast::Sender<()>,
}

/// Create the router.
pub fn create_router(state: Arc<AppState>) -> Router {
    let body_limit = state.config.server.max_body_size;
    Router::new()
        .route("/v1/messages", post(messages_handler))
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/stats", get(stats_handler))
        .route("/shutdown", post(shutdown_handler))
        .route("/pipelines/{id}/reset", post(pipeline_reset_handler))
        .route("/providers/{name}/keys/reset", post(keys_reset_handler))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

/// Cancels the in-flight request if the response future is dropped before
/// completion (client disconnect).
struct DisconnectGuard {
    cancel: tokio_util::sync::CancellationToken,
    armed: bool,
}

impl DisconnectGuard {
    fn new(cancel: tokio_util::sync::CancellationToken) -> Self {
        Self { cancel, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        if self.armed {
            self.cancel.cancel();
        }
    }
}

/// POST /v1/messages — the Anthropic-compatible Messages endpoint.
async fn messages_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let mut request: CanonicalRequest = match serde_json::from_str(&body) {
        Ok(request) => request,
        Err(e) => {
            let error = Error::validation(format!("invalid request body: {e}"));
            return error_response(&error, false, None);
        }
    };

    let ids = resolve_ids(&headers, &mut request);
    let stream = request.stream;
    let chunk_size = state.config.streaming.simulated_chunk_size;

    let submission = match state.flow.submit(request, &ids) {
        Ok(submission) => submission,
        Err(e) => return error_response(&e, stream, Some(&ids.request_id)),
    };

    let mut guard = DisconnectGuard::new(submission.cancel);
    let outcome = submission.receiver.await;
    guard.disarm();

    let result = match outcome {
        Ok(result) => result,
        Err(_) => Err(Error::internal("request processor dropped without responding")
            .with_request_id(ids.request_id.clone())),
    };

    match result {
        Ok(response) => {
            if stream {
                let events = simulate_stream(&response, chunk_size);
                with_request_id(sse_response(events), &ids.request_id)
            } else {
                let mut http = (StatusCode::OK, Json(response)).into_response();
                http = with_request_id(http, &ids.request_id);
                http
            }
        }
        Err(e) => error_response(&e, stream, Some(&ids.request_id)),
    }
}

/// Resolve session/conversation/request ids from headers or metadata, or
/// generate them. Ids are echoed back into the request metadata so inner
/// layers see a complete bag.
fn resolve_ids(headers: &HeaderMap, request: &mut CanonicalRequest) -> RequestIds {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
    };

    let request_id = header("x-request-id")
        .or_else(|| request.metadata.request_id.clone())
        .unwrap_or_else(generate_request_id);
    let session_id = header("x-session-id")
        .or_else(|| request.metadata.session_id.clone())
        .unwrap_or_else(|| format!("sess-{}", uuid::Uuid::new_v4()));
    // Without a conversation id each request is its own conversation and
    // nothing queues behind it.
    let conversation_id = header("x-conversation-id")
        .or_else(|| request.metadata.conversation_id.clone())
        .unwrap_or_else(|| format!("conv-{request_id}"));

    request.metadata.request_id = Some(request_id.clone());
    request.metadata.session_id = Some(session_id.clone());
    request.metadata.conversation_id = Some(conversation_id.clone());

    RequestIds {
        session_id,
        conversation_id,
        request_id,
    }
}

fn error_response(error: &Error, stream: bool, request_id: Option<&str>) -> Response {
    warn!(
        kind = ?error.kind,
        status = error.http_status(),
        request_id = request_id.unwrap_or("-"),
        "Request failed: {error}"
    );
    let mut response = if stream {
        sse_error_response(error)
    } else {
        let status =
            StatusCode::from_u16(error.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(error.to_wire())).into_response()
    };
    if let Some(id) = request_id {
        response = with_request_id(response, id);
    }
    response
}

fn with_request_id(mut response: Response, request_id: &str) -> Response {
    if let Ok(value) = request_id.parse() {
        response
            .headers_mut()
            .insert(HeaderName::from_static("x-request-id"), value);
    }
    response
}

/// GET /health
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let pipelines = state.assembler.pipelines();
    let total = pipelines.len();
    let healthy = pipelines
        .values()
        .filter(|p| p.status() == PipelineStatus::Healthy)
        .count();

    let providers: serde_json::Map<String, Value> = state
        .table
        .providers
        .keys()
        .map(|name| {
            let any_healthy = pipelines
                .values()
                .any(|p| &p.provider == name && p.status() == PipelineStatus::Healthy);
            (name.clone(), Value::Bool(any_healthy))
        })
        .collect();

    let overall = if healthy == total && total > 0 {
        "healthy"
    } else if healthy > 0 {
        "degraded"
    } else {
        "unhealthy"
    };

    Json(json!({
        "overall": overall,
        "healthy": healthy,
        "total": total,
        "providers": providers,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

/// GET /status
async fn status_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let providers: Vec<&String> = state.table.providers.keys().collect();
    Json(json!({
        "server": "llm-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "architecture": "six-layer-pipeline",
        "uptime": state.stats.uptime_secs(),
        "providers": providers,
        "debug": state.config.debug.enabled,
    }))
}

/// GET /stats
async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.stats.snapshot(state.flow.snapshot()))
}

/// POST /shutdown — begins graceful shutdown.
async fn shutdown_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    info!("Shutdown requested via API");
    let _ = state.shutdown_tx.send(());
    Json(json!({"status": "shutting down"}))
}

/// POST /pipelines/{id}/reset — operator reset of a blacklisted pipeline.
async fn pipeline_reset_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    let Some(pipeline) = state.assembler.get(&id) else {
        let error = Error::validation(format!("unknown pipeline `{id}`"));
        return (StatusCode::NOT_FOUND, Json(error.to_wire())).into_response();
    };
    if pipeline.reset() {
        state.switching.reset(&id);
        Json(json!({"pipeline": id, "status": pipeline.status().as_str()})).into_response()
    } else {
        let error = Error::validation(format!("pipeline `{id}` is destroyed and cannot be reset"));
        (StatusCode::CONFLICT, Json(error.to_wire())).into_response()
    }
}

/// POST /providers/{name}/keys/reset — re-enable a provider's API keys.
async fn keys_reset_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Response {
    match state.executor.key_ring(&name) {
        Some(ring) => {
            ring.reset();
            Json(json!({"provider": name, "keys": ring.snapshot()})).into_response()
        }
        None => {
            let error = Error::validation(format!("unknown provider `{name}`"));
            (StatusCode::NOT_FOUND, Json(error.to_wire())).into_response()
        }
    }
}
