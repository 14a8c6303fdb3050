//! Session registry over the external TTL store.
//!
//! The store is the system of record: `session:{id}` holds the JSON session
//! record and `client_sessions:{client}` the client's session ids, both with
//! the session TTL. The store offers no compare-and-set, so every
//! read-modify-write of one record goes through a per-session async lock.
//! Sessions never share a lock.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::config::SessionsConfig;
use crate::error::{AgentGraphError, AgentGraphResult};
use crate::kv::KvStore;
use crate::models::{ConfigPatch, Session, SessionId};

fn session_key(session_id: SessionId) -> String {
    format!("session:{session_id}")
}

fn client_key(client_id: &str) -> String {
    format!("client_sessions:{client_id}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub active_sessions: usize,
    pub ttl_minutes: u64,
    pub max_sessions_per_client: usize,
    pub max_session_bytes: u64,
    pub backend: String,
}

pub struct SessionRegistry {
    store: Arc<dyn KvStore>,
    ttl: Duration,
    max_sessions_per_client: usize,
    max_session_bytes: u64,
    store_timeout: Duration,
    /// Sessions created through this process, with their client. Used to
    /// find expired sessions, since the store cannot enumerate keys.
    known: DashMap<SessionId, String>,
    locks: DashMap<SessionId, Arc<Mutex<()>>>,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn KvStore>, config: &SessionsConfig) -> Self {
        Self {
            store,
            ttl: config.ttl(),
            max_sessions_per_client: config.max_sessions_per_client,
            max_session_bytes: config.max_session_bytes,
            store_timeout: config.store_timeout(),
            known: DashMap::new(),
            locks: DashMap::new(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn backend(&self) -> &str {
        self.store.name()
    }

    /// Bound a store call by the store timeout.
    async fn bounded<T>(
        &self,
        op: &'static str,
        call: impl Future<Output = AgentGraphResult<T>>,
    ) -> AgentGraphResult<T> {
        match tokio::time::timeout(self.store_timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(op, backend = self.store.name(), timeout_ms = self.store_timeout.as_millis() as u64, "Session store call timed out");
                Err(AgentGraphError::StoreUnavailable(format!(
                    "{op} timed out after {}ms",
                    self.store_timeout.as_millis()
                )))
            }
        }
    }

    fn lock(&self, session_id: SessionId) -> Arc<Mutex<()>> {
        self.locks.entry(session_id).or_default().clone()
    }

    async fn load(&self, session_id: SessionId) -> AgentGraphResult<Option<Session>> {
        let raw = self
            .bounded("get", self.store.get(&session_key(session_id)))
            .await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, session: &Session) -> AgentGraphResult<()> {
        let raw = serde_json::to_string(session)?;
        self.bounded(
            "set",
            self.store.set(&session_key(session.session_id), &raw, self.ttl),
        )
        .await
    }

    /// Load, mutate and persist one record under its session lock. The write
    /// renews the TTL.
    async fn modify<F>(&self, session_id: SessionId, mutate: F) -> AgentGraphResult<Session>
    where
        F: FnOnce(&mut Session) -> AgentGraphResult<()>,
    {
        let lock = self.lock(session_id);
        let result = {
            let _held = lock.lock().await;
            match self.load(session_id).await {
                Ok(Some(mut session)) => {
                    session.touch();
                    match mutate(&mut session) {
                        Ok(()) => self.save(&session).await.map(|()| session),
                        Err(e) => Err(e),
                    }
                }
                Ok(None) => Err(AgentGraphError::SessionNotFound(session_id)),
                Err(e) => Err(e),
            }
        };
        drop(lock);

        if matches!(result, Err(AgentGraphError::SessionNotFound(_))) {
            self.release_lock(session_id);
        }
        result
    }

    /// Forget the lock of an absent session unless another caller holds it.
    fn release_lock(&self, session_id: SessionId) {
        self.locks
            .remove_if(&session_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Create a session with the default configuration for `client_id`.
    ///
    /// The client's list is rebuilt on every attempt from the stored list and
    /// the local index, keeping only ids whose record still exists. Racing
    /// creates can overshoot the ceiling by their own number; the next
    /// attempt trims back.
    pub async fn create_session(&self, client_id: &str) -> AgentGraphResult<SessionId> {
        let list_key = client_key(client_id);

        let mut candidates: BTreeSet<SessionId> = BTreeSet::new();
        if let Some(raw) = self.bounded("get", self.store.get(&list_key)).await? {
            match serde_json::from_str::<Vec<SessionId>>(&raw) {
                Ok(ids) => candidates.extend(ids),
                Err(e) => {
                    tracing::warn!(client_id, error = %e, "Discarding unreadable client session list")
                }
            }
        }
        candidates.extend(
            self.known
                .iter()
                .filter(|e| e.value() == client_id)
                .map(|e| *e.key()),
        );

        let mut live = Vec::with_capacity(candidates.len() + 1);
        for id in candidates {
            let exists = self
                .bounded("get", self.store.get(&session_key(id)))
                .await?
                .is_some();
            if exists {
                live.push(id);
            }
        }

        if live.len() >= self.max_sessions_per_client {
            self.write_client_list(&list_key, &live).await?;
            tracing::warn!(client_id, live = live.len(), limit = self.max_sessions_per_client, "Session admission denied");
            return Err(AgentGraphError::AdmissionDenied {
                client_id: client_id.to_string(),
                limit: self.max_sessions_per_client,
            });
        }

        let session = Session::new(client_id);
        let session_id = session.session_id;
        self.save(&session).await?;
        self.known.insert(session_id, client_id.to_string());

        live.push(session_id);
        self.write_client_list(&list_key, &live).await?;

        tracing::info!(session_id = %session_id, client_id, live = live.len(), "Session created");
        Ok(session_id)
    }

    async fn write_client_list(&self, list_key: &str, ids: &[SessionId]) -> AgentGraphResult<()> {
        if ids.is_empty() {
            return self.bounded("delete", self.store.delete(list_key)).await;
        }
        let raw = serde_json::to_string(ids)?;
        self.bounded("set", self.store.set(list_key, &raw, self.ttl))
            .await
    }

    /// Current session record. Renews the TTL and advances `last_seen`.
    pub async fn get_config(&self, session_id: SessionId) -> AgentGraphResult<Session> {
        self.modify(session_id, |_| Ok(())).await
    }

    /// Merge `patch` into the configuration and bump the version. The version
    /// moves even when the patch changes nothing.
    pub async fn update_config(
        &self,
        session_id: SessionId,
        patch: ConfigPatch,
    ) -> AgentGraphResult<Session> {
        let session = self
            .modify(session_id, |session| {
                session.config.apply(patch);
                session.version += 1;
                Ok(())
            })
            .await?;
        tracing::info!(session_id = %session_id, version = session.version, "Session configuration updated");
        Ok(session)
    }

    /// Delete the session record. Destroying an absent session succeeds.
    pub async fn destroy_session(&self, session_id: SessionId) -> AgentGraphResult<()> {
        let lock = self.lock(session_id);
        {
            let _held = lock.lock().await;
            self.bounded("delete", self.store.delete(&session_key(session_id)))
                .await?;
        }
        self.locks.remove(&session_id);
        if self.known.remove(&session_id).is_some() {
            tracing::info!(session_id = %session_id, "Session destroyed");
        }
        Ok(())
    }

    /// Sessions known to this process whose record has expired. Best effort:
    /// a store failure for one id skips that id.
    pub async fn list_expired(&self) -> Vec<SessionId> {
        let ids: Vec<SessionId> = self.known.iter().map(|e| *e.key()).collect();
        let mut expired = Vec::new();
        for id in ids {
            match self
                .bounded("ttl", self.store.ttl_remaining(&session_key(id)))
                .await
            {
                Ok(None) => expired.push(id),
                Ok(Some(_)) => {}
                Err(e) => {
                    tracing::debug!(session_id = %id, error = %e, "Expiry check skipped");
                }
            }
        }
        expired
    }

    /// Read a record without renewing it.
    pub async fn peek(&self, session_id: SessionId) -> AgentGraphResult<Option<Session>> {
        self.load(session_id).await
    }

    /// Count one query against the session. Not a configuration change, so
    /// the version is left alone.
    pub async fn record_query(
        &self,
        session_id: SessionId,
        query: &str,
    ) -> AgentGraphResult<Session> {
        self.modify(session_id, |session| {
            session.total_queries += 1;
            session.last_query = Some(query.to_string());
            Ok(())
        })
        .await
    }

    /// Record the bytes a session holds on disk. The figure is stored even
    /// when it is over quota, so the overage stays visible.
    pub async fn record_disk_usage(
        &self,
        session_id: SessionId,
        bytes: u64,
    ) -> AgentGraphResult<Session> {
        let session = self
            .modify(session_id, |session| {
                session.session_size_bytes = bytes;
                Ok(())
            })
            .await?;
        if bytes > self.max_session_bytes {
            tracing::warn!(session_id = %session_id, bytes, limit = self.max_session_bytes, "Session over storage quota");
            return Err(AgentGraphError::QuotaExceeded {
                used: bytes,
                limit: self.max_session_bytes,
            });
        }
        Ok(session)
    }

    /// Known sessions whose record is still live.
    pub async fn live_sessions(&self) -> AgentGraphResult<Vec<SessionId>> {
        let ids: Vec<SessionId> = self.known.iter().map(|e| *e.key()).collect();
        let mut live = Vec::with_capacity(ids.len());
        for id in ids {
            if self
                .bounded("ttl", self.store.ttl_remaining(&session_key(id)))
                .await?
                .is_some()
            {
                live.push(id);
            }
        }
        Ok(live)
    }

    /// Let the store drop expired records it still holds.
    pub async fn purge_expired(&self) -> AgentGraphResult<u64> {
        self.bounded("purge", self.store.purge_expired()).await
    }

    pub async fn stats(&self) -> AgentGraphResult<SessionStats> {
        Ok(SessionStats {
            active_sessions: self.live_sessions().await?.len(),
            ttl_minutes: self.ttl.as_secs() / 60,
            max_sessions_per_client: self.max_sessions_per_client,
            max_session_bytes: self.max_session_bytes,
            backend: self.store.name().to_string(),
        })
    }
}
