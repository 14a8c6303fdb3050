use serde::{Deserialize, Serialize};

use crate::error::AgentGraphError;
use crate::models::{ConfigPatch, SessionId};

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AgentGraphRequest {
    Ping,
    Health,
    CreateSession {
        client_id: String,
    },
    GetConfig {
        session_id: SessionId,
    },
    UpdateConfig {
        session_id: SessionId,
        #[serde(default)]
        patch: ConfigPatch,
    },
    DestroySession {
        session_id: SessionId,
    },
    RecordQuery {
        session_id: SessionId,
        query: String,
    },
    Usage {
        session_id: SessionId,
    },
    Stats,
    Sweep,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AgentGraphResponse {
    pub status: String,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    /// Machine-readable error code, see `AgentGraphError::code`.
    pub code: Option<String>,
    pub version: String,
}

impl AgentGraphResponse {
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            status: "ok".to_string(),
            data: Some(data),
            error: None,
            code: None,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            data: None,
            error: Some(msg.into()),
            code: None,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn from_error(e: &AgentGraphError) -> Self {
        Self {
            code: Some(e.code().to_string()),
            ..Self::err(e.to_string())
        }
    }

    pub fn pong() -> Self {
        Self::ok(serde_json::json!({"pong": true}))
    }

    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}
