//! HTTP integration tests for the AgentGraph REST API
//!
//! Full end-to-end handler dispatch through the Axum router with `oneshot`,
//! over an in-memory session store and a temporary session root.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::json;
use tower::ServiceExt;

use agentgraph_core::{AgentGraphConfig, MemoryKvStore, SessionDirectoryAllocator};
use agentgraph_server::http::build_router;
use agentgraph_server::state::AppState;

fn make_app(root: &std::path::Path, max_sessions_per_client: usize) -> Router {
    let mut config = AgentGraphConfig::default();
    config.sessions.max_sessions_per_client = max_sessions_per_client;
    let state = AppState::with_directories(
        config,
        Arc::new(MemoryKvStore::new()),
        SessionDirectoryAllocator::new(root),
    );
    build_router(Arc::new(state))
}

async fn call(app: &Router, method: &str, uri: &str, body: Option<serde_json::Value>) -> (StatusCode, serde_json::Value) {
    let builder = Request::builder().method(method).uri(uri);
    let req = match body {
        Some(b) => builder
            .header("content-type", "application/json")
            .body(Body::from(b.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, json)
}

// ===========================================================================
// TEST 1: GET /version: returns version and protocol
// ===========================================================================
#[tokio::test]
async fn test_version_endpoint() {
    let tmp = tempfile::tempdir().unwrap();
    let app = make_app(tmp.path(), 5);

    let (status, json) = call(&app, "GET", "/version", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(json["version"].is_string());
    assert_eq!(json["protocol"], "agentgraph/1");
}

// ===========================================================================
// TEST 2: full session lifecycle over HTTP
// ===========================================================================
#[tokio::test]
async fn test_session_lifecycle_via_oneshot() {
    let tmp = tempfile::tempdir().unwrap();
    let app = make_app(tmp.path(), 5);

    let (status, created) = call(&app, "POST", "/sessions", Some(json!({"client_id": "10.0.0.1"}))).await;
    assert_eq!(status, StatusCode::CREATED, "{created}");
    let id = created["session_id"].as_str().unwrap().to_string();
    assert!(tmp.path().join(&id).join("uploads").is_dir());

    let (status, session) = call(&app, "GET", &format!("/sessions/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(session["version"], 1);
    assert_eq!(session["selected_model"], "gpt-4o-mini");

    let (status, updated) = call(
        &app,
        "PATCH",
        &format!("/sessions/{id}"),
        Some(json!({"selected_model": "gpt-4o", "top_k": 25})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["version"], 2);
    assert_eq!(updated["selected_model"], "gpt-4o");
    assert_eq!(updated["top_k"], 25);

    let (status, counted) = call(
        &app,
        "POST",
        &format!("/sessions/{id}/queries"),
        Some(json!({"query": "revenue by region"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(counted["total_queries"], 1);

    let (status, destroyed) = call(&app, "DELETE", &format!("/sessions/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(destroyed["destroyed"], true);
    assert!(!tmp.path().join(&id).exists());

    let (status, _) = call(&app, "GET", &format!("/sessions/{id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // destroying twice is fine
    let (status, _) = call(&app, "DELETE", &format!("/sessions/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
}

// ===========================================================================
// TEST 3: admission ceiling of one, released by destroy
// ===========================================================================
#[tokio::test]
async fn test_admission_ceiling_via_oneshot() {
    let tmp = tempfile::tempdir().unwrap();
    let app = make_app(tmp.path(), 1);
    let body = || Some(json!({"client_id": "10.0.0.1"}));

    let (status, first) = call(&app, "POST", "/sessions", body()).await;
    assert_eq!(status, StatusCode::CREATED);
    let first_id = first["session_id"].as_str().unwrap().to_string();

    let (status, denied) = call(&app, "POST", "/sessions", body()).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(denied["code"], "admission_denied");

    let (status, _) = call(&app, "DELETE", &format!("/sessions/{first_id}"), None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, second) = call(&app, "POST", "/sessions", body()).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_ne!(second["session_id"].as_str().unwrap(), first_id);
}

// ===========================================================================
// TEST 4: client id falls back to X-Forwarded-For
// ===========================================================================
#[tokio::test]
async fn test_create_session_without_body_uses_forwarded_for() {
    let tmp = tempfile::tempdir().unwrap();
    let app = make_app(tmp.path(), 1);

    let req = || {
        Request::builder()
            .method("POST")
            .uri("/sessions")
            .header("x-forwarded-for", "203.0.113.7")
            .body(Body::empty())
            .unwrap()
    };
    let resp = app.clone().oneshot(req()).await.unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let resp = app.clone().oneshot(req()).await.unwrap();
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
}

// ===========================================================================
// TEST 5: malformed session id is rejected before touching the store
// ===========================================================================
#[tokio::test]
async fn test_malformed_session_id_is_bad_request() {
    let tmp = tempfile::tempdir().unwrap();
    let app = make_app(tmp.path(), 5);

    let (status, body) = call(&app, "GET", "/sessions/not-a-session", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_session_id");
}

// ===========================================================================
// TEST 6: stats, health and manual sweep
// ===========================================================================
#[tokio::test]
async fn test_stats_health_and_sweep() {
    let tmp = tempfile::tempdir().unwrap();
    let app = make_app(tmp.path(), 5);

    call(&app, "POST", "/sessions", Some(json!({"client_id": "10.0.0.1"}))).await;
    call(&app, "POST", "/sessions", Some(json!({"client_id": "10.0.0.2"}))).await;

    let (status, stats) = call(&app, "GET", "/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["sessions"]["active_sessions"], 2);
    assert_eq!(stats["objects"]["entries"], 0);

    let (status, health) = call(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "healthy");

    let (status, report) = call(&app, "POST", "/sweep", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["sessions_reclaimed"], 0);
    assert_eq!(report["failures"], 0);
}
