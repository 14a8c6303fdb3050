//! Per-session filesystem namespaces.
//!
//! Layout under the storage root:
//!
//! ```text
//! <root>/<session_id>/db.db      session store file (written by ingestion)
//! <root>/<session_id>/uploads/   raw uploaded files
//! <root>/<session_id>/temp/      scratch space
//! <root>/<session_id>/cache/     local artifact cache
//! ```

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

use crate::config::StorageConfig;
use crate::error::{AgentGraphError, AgentGraphResult};
use crate::models::SessionId;

const STORE_FILE: &str = "db.db";
const UPLOADS_DIR: &str = "uploads";
const TEMP_DIR: &str = "temp";
const CACHE_DIR: &str = "cache";

const REMOVE_RETRIES: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPaths {
    pub root: PathBuf,
    pub store_file: PathBuf,
    pub uploads_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub cache_dir: PathBuf,
}

impl SessionPaths {
    /// SQLite URI of the session store file.
    pub fn store_uri(&self) -> String {
        format!("sqlite://{}", self.store_file.display())
    }
}

#[derive(Debug, Clone)]
pub struct SessionDirectoryAllocator {
    root: PathBuf,
}

impl SessionDirectoryAllocator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(config.resolve_root())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn ensure_root(&self) -> AgentGraphResult<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| AgentGraphError::storage(&self.root, e))
    }

    /// Paths of a session's subtree. Touches nothing on disk.
    pub fn layout(&self, session_id: SessionId) -> SessionPaths {
        let root = self.root.join(session_id.to_string());
        SessionPaths {
            store_file: root.join(STORE_FILE),
            uploads_dir: root.join(UPLOADS_DIR),
            temp_dir: root.join(TEMP_DIR),
            cache_dir: root.join(CACHE_DIR),
            root,
        }
    }

    /// Paths of a session's subtree, creating the directories if needed.
    pub async fn paths_for(&self, session_id: SessionId) -> AgentGraphResult<SessionPaths> {
        let paths = self.layout(session_id);
        for dir in [&paths.uploads_dir, &paths.temp_dir, &paths.cache_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| AgentGraphError::storage(dir, e))?;
        }
        Ok(paths)
    }

    /// Delete a session's subtree. Returns the bytes it held; an absent
    /// subtree frees nothing and is not an error.
    pub async fn remove(&self, session_id: SessionId) -> AgentGraphResult<u64> {
        let dir = self.layout(session_id).root;
        let bytes = dir_size(&dir).await.unwrap_or(0);

        let strategy = ExponentialBackoff::from_millis(2)
            .factor(25)
            .max_delay(Duration::from_secs(1))
            .map(jitter)
            .take(REMOVE_RETRIES);

        let target = &dir;
        let result = Retry::spawn(strategy, move || async move {
            match tokio::fs::remove_dir_all(target).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => {
                    tracing::warn!(path = %target.display(), error = %e, "Session directory removal failed");
                    Err(e)
                }
            }
        })
        .await;

        match result {
            Ok(()) => {
                if bytes > 0 {
                    tracing::debug!(session_id = %session_id, bytes, "Session directory removed");
                }
                Ok(bytes)
            }
            Err(e) => Err(AgentGraphError::storage(dir, e)),
        }
    }

    /// Bytes currently held by a session's subtree.
    pub async fn usage(&self, session_id: SessionId) -> AgentGraphResult<u64> {
        let dir = self.layout(session_id).root;
        dir_size(&dir)
            .await
            .map_err(|e| AgentGraphError::storage(dir, e))
    }

    /// Session ids that currently own a directory under the root. Entries that
    /// are not directories, or whose names are not session ids, are ignored.
    pub async fn list_session_dirs(&self) -> AgentGraphResult<Vec<SessionId>> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(AgentGraphError::storage(&self.root, e)),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| AgentGraphError::storage(&self.root, e))?
        {
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if !is_dir {
                continue;
            }
            if let Some(id) = entry.file_name().to_str().and_then(|n| n.parse().ok()) {
                ids.push(id);
            }
        }
        Ok(ids)
    }
}

/// Recursive size of a directory tree without following symlinks. A missing
/// tree has size zero.
async fn dir_size(root: &Path) -> std::io::Result<u64> {
    let mut total = 0u64;
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        while let Some(entry) = entries.next_entry().await? {
            let meta = match tokio::fs::symlink_metadata(entry.path()).await {
                Ok(meta) => meta,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };
            if meta.is_dir() {
                pending.push(entry.path());
            } else {
                total += meta.len();
            }
        }
    }
    Ok(total)
}
