//! TTL key-value store: the system of record for session metadata.
//!
//! Provides a `KvStore` trait with implementations for:
//! - **Memory**: process-local map with per-key deadlines on the tokio clock
//! - **Postgres**: durable table with an `expires_at` column; expired rows
//!   are invisible to reads and purged lazily

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::PgPool;
use tokio::time::Instant;

use crate::error::{AgentGraphError, AgentGraphResult};

// ============================================================================
// KvStore trait
// ============================================================================

/// Contract of the external TTL store. Single-key operations only.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Write `value` under `key`, replacing any previous value and deadline.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> AgentGraphResult<()>;

    /// Read a live value. Expired keys read as absent.
    async fn get(&self, key: &str) -> AgentGraphResult<Option<String>>;

    /// Remove a key. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> AgentGraphResult<()>;

    /// Time left before `key` expires, or `None` if it is absent or expired.
    async fn ttl_remaining(&self, key: &str) -> AgentGraphResult<Option<Duration>>;

    /// Drop expired records eagerly. Stores with native expiry have nothing to do.
    async fn purge_expired(&self) -> AgentGraphResult<u64> {
        Ok(0)
    }

    /// Backend name for logging.
    fn name(&self) -> &str;
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: String,
    deadline: Instant,
}

/// Process-local TTL store. Deadlines use `tokio::time::Instant`, so tests can
/// drive expiry with a paused clock.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: DashMap<String, MemoryEntry>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn live(&self, key: &str) -> Option<MemoryEntry> {
        let now = Instant::now();
        let entry = self.entries.get(key)?.clone();
        if entry.deadline <= now {
            self.entries.remove_if(key, |_, e| e.deadline <= now);
            return None;
        }
        Some(entry)
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> AgentGraphResult<()> {
        self.entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                deadline: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> AgentGraphResult<Option<String>> {
        Ok(self.live(key).map(|e| e.value))
    }

    async fn delete(&self, key: &str) -> AgentGraphResult<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn ttl_remaining(&self, key: &str) -> AgentGraphResult<Option<Duration>> {
        Ok(self
            .live(key)
            .map(|e| e.deadline.saturating_duration_since(Instant::now())))
    }

    async fn purge_expired(&self) -> AgentGraphResult<u64> {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| e.deadline > now);
        Ok(before.saturating_sub(self.entries.len()) as u64)
    }

    fn name(&self) -> &str {
        "memory"
    }
}

// ============================================================================
// Postgres store
// ============================================================================

/// Durable TTL store on a single Postgres table.
pub struct PgKvStore {
    pool: PgPool,
}

impl PgKvStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the backing table if it does not exist.
    pub async fn ensure_schema(&self) -> AgentGraphResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS agentgraph_kv (
                key        TEXT PRIMARY KEY,
                value      TEXT NOT NULL,
                expires_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS agentgraph_kv_expires_at ON agentgraph_kv (expires_at)",
        )
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(())
    }
}

fn store_err(e: sqlx::Error) -> AgentGraphError {
    AgentGraphError::StoreUnavailable(e.to_string())
}

#[async_trait]
impl KvStore for PgKvStore {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> AgentGraphResult<()> {
        sqlx::query(
            r#"
            INSERT INTO agentgraph_kv (key, value, expires_at)
            VALUES ($1, $2, NOW() + $3 * INTERVAL '1 millisecond')
            ON CONFLICT (key) DO UPDATE
            SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(ttl.as_millis() as f64)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> AgentGraphResult<Option<String>> {
        sqlx::query_scalar("SELECT value FROM agentgraph_kv WHERE key = $1 AND expires_at > NOW()")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)
    }

    async fn delete(&self, key: &str) -> AgentGraphResult<()> {
        sqlx::query("DELETE FROM agentgraph_kv WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn ttl_remaining(&self, key: &str) -> AgentGraphResult<Option<Duration>> {
        let millis: Option<f64> = sqlx::query_scalar(
            r#"
            SELECT (EXTRACT(EPOCH FROM (expires_at - NOW())) * 1000)::double precision
            FROM agentgraph_kv
            WHERE key = $1 AND expires_at > NOW()
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(millis.map(|ms| Duration::from_millis(ms.max(0.0) as u64)))
    }

    async fn purge_expired(&self) -> AgentGraphResult<u64> {
        let result = sqlx::query("DELETE FROM agentgraph_kv WHERE expires_at <= NOW()")
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(result.rows_affected())
    }

    fn name(&self) -> &str {
        "postgres"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_memory_store_expires_keys() {
        let store = MemoryKvStore::new();
        store.set("a", "1", Duration::from_secs(10)).await.unwrap();

        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("1"));
        let left = store.ttl_remaining("a").await.unwrap().unwrap();
        assert!(left <= Duration::from_secs(10));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(store.get("a").await.unwrap(), None);
        assert_eq!(store.ttl_remaining("a").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_store_set_replaces_deadline() {
        let store = MemoryKvStore::new();
        store.set("a", "1", Duration::from_secs(10)).await.unwrap();
        tokio::time::advance(Duration::from_secs(8)).await;
        store.set("a", "2", Duration::from_secs(10)).await.unwrap();
        tokio::time::advance(Duration::from_secs(8)).await;

        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_store_purge_and_delete() {
        let store = MemoryKvStore::new();
        store.set("short", "x", Duration::from_secs(1)).await.unwrap();
        store.set("long", "y", Duration::from_secs(100)).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(store.purge_expired().await.unwrap(), 1);

        store.delete("long").await.unwrap();
        store.delete("long").await.unwrap();
        assert_eq!(store.get("long").await.unwrap(), None);
    }
}
