//! AgentGraph HTTP REST API
//!
//! Axum-based HTTP server exposing the session lifecycle next to the Unix
//! socket IPC server, on port 8780 by default.
//!
//! Each endpoint is a thin axum handler over an inner function that returns
//! `(StatusCode, json)`; the inner functions are testable without axum.
//!
//! Endpoints:
//! - GET    /health                : health check
//! - GET    /version               : server version info
//! - GET    /stats                 : session, cache and storage stats
//! - POST   /sessions              : create a session
//! - GET    /sessions/:id          : read (and renew) a session
//! - PATCH  /sessions/:id          : update a session's configuration
//! - DELETE /sessions/:id          : destroy a session and reclaim it
//! - POST   /sessions/:id/queries  : count a query against a session
//! - GET    /sessions/:id/usage    : measure and record disk usage
//! - POST   /sweep                 : run a sweep cycle now

use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use agentgraph_core::ipc::AgentGraphRequest;
use agentgraph_core::{AgentGraphError, BuildError, ConfigPatch, SessionId};

use crate::router::dispatch;
use crate::state::AppState;

/// Build the Axum router with all endpoints
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .route("/stats", get(stats_handler))
        .route("/sessions", post(create_session_handler))
        .route(
            "/sessions/:id",
            get(get_session_handler)
                .patch(update_session_handler)
                .delete(destroy_session_handler),
        )
        .route("/sessions/:id/queries", post(record_query_handler))
        .route("/sessions/:id/usage", get(usage_handler))
        .route("/sweep", post(sweep_handler))
        .with_state(state)
}

/// Start the HTTP server on the configured address.
/// Gracefully shuts down when the broadcast shutdown signal fires.
pub async fn start_http_server(
    state: Arc<AppState>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let addr = format!("{}:{}", state.config.http.host, state.config.http.port);

    let app = build_router(state);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("AgentGraph HTTP API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            tracing::info!("HTTP server shutting down...");
        })
        .await?;

    Ok(())
}

// ============================================================================
// Request DTOs
// ============================================================================

#[derive(Debug, Deserialize, Default)]
pub struct CreateSessionRequest {
    /// Explicit client identifier. Falls back to `X-Forwarded-For`, then
    /// `"unknown"`.
    pub client_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RecordQueryRequest {
    pub query: String,
}

// ============================================================================
// Error mapping
// ============================================================================

pub fn status_for(error: &AgentGraphError) -> StatusCode {
    match error {
        AgentGraphError::AdmissionDenied { .. } => StatusCode::TOO_MANY_REQUESTS,
        AgentGraphError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        AgentGraphError::BuildFailed(BuildError::Timeout) => StatusCode::GATEWAY_TIMEOUT,
        AgentGraphError::BuildFailed(_) => StatusCode::BAD_GATEWAY,
        AgentGraphError::StorageUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        AgentGraphError::QuotaExceeded { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        AgentGraphError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        AgentGraphError::Serialization(_) | AgentGraphError::Config(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn error_body(error: &AgentGraphError) -> serde_json::Value {
    serde_json::json!({
        "error": error.to_string(),
        "code": error.code(),
        "status": "error",
    })
}

fn bad_session_id(raw: &str) -> (StatusCode, serde_json::Value) {
    (
        StatusCode::BAD_REQUEST,
        serde_json::json!({
            "error": format!("invalid session id: {raw}"),
            "code": "invalid_session_id",
            "status": "error",
        }),
    )
}

/// Run a request through the shared dispatcher and map the outcome.
async fn run(
    state: &AppState,
    request: AgentGraphRequest,
    success: StatusCode,
) -> (StatusCode, serde_json::Value) {
    match dispatch(request, state).await {
        Ok(data) => (success, data),
        Err(e) => {
            let status = status_for(&e);
            if status.is_server_error() {
                tracing::warn!(code = e.code(), error = %e, "Request failed");
            }
            (status, error_body(&e))
        }
    }
}

// ============================================================================
// Inner (directly testable) functions
// ============================================================================

pub async fn health_inner(state: &AppState) -> (StatusCode, serde_json::Value) {
    match dispatch(AgentGraphRequest::Health, state).await {
        Ok(data) => (StatusCode::OK, data),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            serde_json::json!({
                "status": "unhealthy",
                "error": e.to_string(),
            }),
        ),
    }
}

/// Inner version: returns version info (pure, no IO).
pub fn version_inner() -> serde_json::Value {
    serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": "agentgraph/1",
    })
}

pub async fn stats_inner(state: &AppState) -> (StatusCode, serde_json::Value) {
    run(state, AgentGraphRequest::Stats, StatusCode::OK).await
}

pub async fn create_session_inner(
    state: &AppState,
    headers: &HeaderMap,
    req: CreateSessionRequest,
) -> (StatusCode, serde_json::Value) {
    let client_id = req
        .client_id
        .filter(|c| !c.trim().is_empty())
        .or_else(|| forwarded_for(headers))
        .unwrap_or_else(|| "unknown".to_string());

    run(state, AgentGraphRequest::CreateSession { client_id }, StatusCode::CREATED).await
}

pub async fn get_session_inner(state: &AppState, raw_id: &str) -> (StatusCode, serde_json::Value) {
    let Ok(session_id) = raw_id.parse::<SessionId>() else {
        return bad_session_id(raw_id);
    };
    run(state, AgentGraphRequest::GetConfig { session_id }, StatusCode::OK).await
}

pub async fn update_session_inner(
    state: &AppState,
    raw_id: &str,
    patch: ConfigPatch,
) -> (StatusCode, serde_json::Value) {
    let Ok(session_id) = raw_id.parse::<SessionId>() else {
        return bad_session_id(raw_id);
    };
    run(state, AgentGraphRequest::UpdateConfig { session_id, patch }, StatusCode::OK).await
}

pub async fn destroy_session_inner(state: &AppState, raw_id: &str) -> (StatusCode, serde_json::Value) {
    let Ok(session_id) = raw_id.parse::<SessionId>() else {
        return bad_session_id(raw_id);
    };
    run(state, AgentGraphRequest::DestroySession { session_id }, StatusCode::OK).await
}

pub async fn record_query_inner(
    state: &AppState,
    raw_id: &str,
    req: RecordQueryRequest,
) -> (StatusCode, serde_json::Value) {
    let Ok(session_id) = raw_id.parse::<SessionId>() else {
        return bad_session_id(raw_id);
    };
    let request = AgentGraphRequest::RecordQuery {
        session_id,
        query: req.query,
    };
    run(state, request, StatusCode::OK).await
}

pub async fn usage_inner(state: &AppState, raw_id: &str) -> (StatusCode, serde_json::Value) {
    let Ok(session_id) = raw_id.parse::<SessionId>() else {
        return bad_session_id(raw_id);
    };
    run(state, AgentGraphRequest::Usage { session_id }, StatusCode::OK).await
}

pub async fn sweep_inner(state: &AppState) -> (StatusCode, serde_json::Value) {
    run(state, AgentGraphRequest::Sweep, StatusCode::OK).await
}

// ============================================================================
// Axum handler wrappers (thin, delegating to inner functions)
// ============================================================================

pub async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let (status, body) = health_inner(&state).await;
    (status, Json(body))
}

pub async fn version_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(version_inner()))
}

pub async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let (status, body) = stats_inner(&state).await;
    (status, Json(body))
}

pub async fn create_session_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    req: Option<Json<CreateSessionRequest>>,
) -> impl IntoResponse {
    let req = req.map(|Json(r)| r).unwrap_or_default();
    let (status, body) = create_session_inner(&state, &headers, req).await;
    (status, Json(body))
}

pub async fn get_session_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let (status, body) = get_session_inner(&state, &id).await;
    (status, Json(body))
}

pub async fn update_session_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(patch): Json<ConfigPatch>,
) -> impl IntoResponse {
    let (status, body) = update_session_inner(&state, &id, patch).await;
    (status, Json(body))
}

pub async fn destroy_session_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let (status, body) = destroy_session_inner(&state, &id).await;
    (status, Json(body))
}

pub async fn record_query_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<RecordQueryRequest>,
) -> impl IntoResponse {
    let (status, body) = record_query_inner(&state, &id, req).await;
    (status, Json(body))
}

pub async fn usage_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let (status, body) = usage_inner(&state, &id).await;
    (status, Json(body))
}

pub async fn sweep_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let (status, body) = sweep_inner(&state).await;
    (status, Json(body))
}

// ============================================================================
// Helpers
// ============================================================================

/// First address of an `X-Forwarded-For` header.
fn forwarded_for(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")?
        .to_str()
        .ok()?
        .split(',')
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}
