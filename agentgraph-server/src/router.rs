use agentgraph_core::ipc::{AgentGraphRequest, AgentGraphResponse};
use agentgraph_core::AgentGraphResult;

use crate::state::AppState;

/// Handle one IPC request. Errors are folded into the response envelope.
pub async fn handle_request(request: AgentGraphRequest, state: &AppState) -> AgentGraphResponse {
    match request {
        AgentGraphRequest::Ping => AgentGraphResponse::pong(),
        request => match dispatch(request, state).await {
            Ok(data) => AgentGraphResponse::ok(data),
            Err(e) => {
                tracing::debug!(code = e.code(), error = %e, "Request failed");
                AgentGraphResponse::from_error(&e)
            }
        },
    }
}

/// Run a request against the core and return its payload. Shared by the IPC
/// server and the HTTP API, which maps the typed error to a status code.
pub async fn dispatch(
    request: AgentGraphRequest,
    state: &AppState,
) -> AgentGraphResult<serde_json::Value> {
    match request {
        AgentGraphRequest::Ping => Ok(serde_json::json!({"pong": true})),
        AgentGraphRequest::Health => {
            state.directories.ensure_root().await?;
            Ok(serde_json::json!({
                "status": "healthy",
                "version": env!("CARGO_PKG_VERSION"),
                "kv_backend": state.sessions.backend(),
                "storage_root": state.directories.root().display().to_string(),
                "socket": state.config.service.socket_path,
            }))
        }
        AgentGraphRequest::CreateSession { client_id } => {
            let session_id = state.sessions.create_session(&client_id).await?;
            if let Err(e) = state.directories.paths_for(session_id).await {
                // give the admission slot back
                if let Err(undo) = state.sessions.destroy_session(session_id).await {
                    tracing::warn!(session_id = %session_id, error = %undo, "Rollback of failed session create failed");
                }
                return Err(e);
            }
            Ok(serde_json::json!({
                "session_id": session_id,
                "ttl_minutes": state.sessions.ttl().as_secs() / 60,
            }))
        }
        AgentGraphRequest::GetConfig { session_id } => {
            let session = state.sessions.get_config(session_id).await?;
            Ok(serde_json::to_value(session)?)
        }
        AgentGraphRequest::UpdateConfig { session_id, patch } => {
            let session = state.sessions.update_config(session_id, patch).await?;
            Ok(serde_json::to_value(session)?)
        }
        AgentGraphRequest::DestroySession { session_id } => {
            let reclaimed = state.sweeper.reclaim_session(session_id).await?;
            Ok(serde_json::json!({
                "session_id": session_id,
                "destroyed": true,
                "reclaimed": reclaimed,
            }))
        }
        AgentGraphRequest::RecordQuery { session_id, query } => {
            let session = state.sessions.record_query(session_id, &query).await?;
            Ok(serde_json::json!({
                "session_id": session_id,
                "total_queries": session.total_queries,
            }))
        }
        AgentGraphRequest::Usage { session_id } => {
            let bytes = state.directories.usage(session_id).await?;
            state.sessions.record_disk_usage(session_id, bytes).await?;
            Ok(serde_json::json!({
                "session_id": session_id,
                "bytes": bytes,
                "limit": state.config.sessions.max_session_bytes,
            }))
        }
        AgentGraphRequest::Stats => {
            let sessions = state.sessions.stats().await?;
            Ok(serde_json::json!({
                "sessions": sessions,
                "objects": state.cache.registry().stats(),
                "storage_root": state.directories.root().display().to_string(),
            }))
        }
        AgentGraphRequest::Sweep => {
            let report = state.sweeper.run_sweep_cycle().await;
            Ok(serde_json::to_value(report)?)
        }
    }
}
