use std::path::PathBuf;

use thiserror::Error;

use crate::models::SessionId;

pub type AgentGraphResult<T> = Result<T, AgentGraphError>;

#[derive(Error, Debug)]
pub enum AgentGraphError {
    #[error("Client {client_id} already holds the maximum of {limit} live sessions")]
    AdmissionDenied { client_id: String, limit: usize },

    #[error("Session not found or expired: {0}")]
    SessionNotFound(SessionId),

    #[error("Build failed: {0}")]
    BuildFailed(#[from] BuildError),

    #[error("Storage unavailable at {}: {source}", path.display())]
    StorageUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Session storage quota exceeded: {used} of {limit} bytes")]
    QuotaExceeded { used: u64, limit: u64 },

    #[error("Session store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),
}

impl AgentGraphError {
    pub fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::StorageUnavailable {
            path: path.into(),
            source,
        }
    }

    /// Stable machine-readable code, used by the transport layer.
    pub fn code(&self) -> &'static str {
        match self {
            Self::AdmissionDenied { .. } => "admission_denied",
            Self::SessionNotFound(_) => "session_not_found",
            Self::BuildFailed(BuildError::Timeout) => "build_timeout",
            Self::BuildFailed(_) => "build_failed",
            Self::StorageUnavailable { .. } => "storage_unavailable",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::Serialization(_) => "serialization",
            Self::Config(_) => "config",
        }
    }
}

/// Failure of a cache-backed construction.
///
/// `Clone` because one build outcome fans out to every caller waiting on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("{0}")]
    Failed(String),

    #[error("build exceeded its deadline")]
    Timeout,

    #[error("build was cancelled")]
    Cancelled,

    #[error("cached handle has a different type than requested")]
    TypeMismatch,
}

impl BuildError {
    pub fn failed(reason: impl std::fmt::Display) -> Self {
        Self::Failed(reason.to_string())
    }
}
