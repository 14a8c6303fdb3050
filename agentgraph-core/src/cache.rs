//! Versioned, per-session cache of query agents, store connections and
//! rendered artifacts.
//!
//! Nothing is ever invalidated explicitly. A key carries the configuration
//! version and the data fingerprint, so a configuration update or a changed
//! dataset simply derives a different key; the stale entry is reclaimed by
//! session eviction or capacity pressure.

use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

use crate::config::CacheConfig;
use crate::db::{self, StoreConnection};
use crate::error::{AgentGraphError, AgentGraphResult, BuildError};
use crate::models::{CacheKey, ConnectionType, ObjectKind, Session};
use crate::paths::SessionDirectoryAllocator;
use crate::registry::{Footprint, ObjectRegistry};

pub struct ResultCache {
    registry: Arc<ObjectRegistry>,
    directories: SessionDirectoryAllocator,
    fingerprints: Fingerprinter,
    build_timeout: Duration,
}

impl ResultCache {
    pub fn new(
        registry: Arc<ObjectRegistry>,
        directories: SessionDirectoryAllocator,
        config: &CacheConfig,
    ) -> Self {
        Self {
            registry,
            directories,
            fingerprints: Fingerprinter::default(),
            build_timeout: config.build_timeout(),
        }
    }

    pub fn registry(&self) -> &Arc<ObjectRegistry> {
        &self.registry
    }

    /// Cache key for `session` over a dataset with `fingerprint`.
    ///
    /// Only inputs that change what a cached object does are included;
    /// timestamps, counters and display toggles are not.
    pub fn derive_key(&self, session: &Session, fingerprint: Option<String>) -> CacheKey {
        let config = &session.config;
        let connection_descriptor = match (config.connection_type, &config.db_uri) {
            (_, Some(uri)) => uri.clone(),
            (ConnectionType::Csv, None) => self.directories.layout(session.session_id).store_uri(),
            (ConnectionType::Postgresql, None) => String::new(),
        };

        CacheKey {
            session_id: session.session_id,
            tenant_id: config.tenant_id.clone(),
            model: config.selected_model.clone(),
            connection_type: config.connection_type,
            connection_descriptor,
            table_filter: config.table_filter().to_string(),
            data_fingerprint: fingerprint,
            top_k: config.top_k,
            config_version: session.version,
        }
    }

    /// Fingerprint of the session's local dataset. Only session-local stores
    /// have one; an external database is identified by its URI alone.
    pub async fn dataset_fingerprint(&self, session: &Session) -> AgentGraphResult<Option<String>> {
        if session.config.connection_type != ConnectionType::Csv || session.config.db_uri.is_some() {
            return Ok(None);
        }
        let paths = self.directories.layout(session.session_id);
        self.fingerprints.fingerprint(&paths.store_file).await
    }

    async fn cached<T, F, Fut>(
        &self,
        kind: ObjectKind,
        session: &Session,
        fingerprint: Option<String>,
        builder: F,
    ) -> AgentGraphResult<Arc<T>>
    where
        T: Footprint + Send + Sync + 'static,
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, BuildError>> + Send + 'static,
    {
        let key = self.derive_key(session, fingerprint);
        self.registry
            .get_or_create(session.session_id, kind, key, self.build_timeout, builder)
            .await
    }

    pub async fn agent<T, F, Fut>(
        &self,
        session: &Session,
        fingerprint: Option<String>,
        builder: F,
    ) -> AgentGraphResult<Arc<T>>
    where
        T: Footprint + Send + Sync + 'static,
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, BuildError>> + Send + 'static,
    {
        self.cached(ObjectKind::QueryAgent, session, fingerprint, builder)
            .await
    }

    pub async fn store<T, F, Fut>(
        &self,
        session: &Session,
        fingerprint: Option<String>,
        builder: F,
    ) -> AgentGraphResult<Arc<T>>
    where
        T: Footprint + Send + Sync + 'static,
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, BuildError>> + Send + 'static,
    {
        self.cached(ObjectKind::StoreConnection, session, fingerprint, builder)
            .await
    }

    pub async fn artifact<T, F, Fut>(
        &self,
        session: &Session,
        fingerprint: Option<String>,
        builder: F,
    ) -> AgentGraphResult<Arc<T>>
    where
        T: Footprint + Send + Sync + 'static,
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, BuildError>> + Send + 'static,
    {
        self.cached(ObjectKind::RenderedArtifact, session, fingerprint, builder)
            .await
    }

    /// Cached connection to the session's queryable store. The session
    /// subtree is created first so a local SQLite file has somewhere to live.
    pub async fn open_store(&self, session: &Session) -> AgentGraphResult<Arc<StoreConnection>> {
        self.directories.paths_for(session.session_id).await?;

        let key = self.derive_key(session, None);
        let connection_type = key.connection_type;
        let descriptor = key.connection_descriptor.clone();
        self.registry
            .get_or_create(
                session.session_id,
                ObjectKind::StoreConnection,
                key,
                self.build_timeout,
                move |cancel| async move {
                    tokio::select! {
                        _ = cancel.cancelled() => Err(BuildError::Cancelled),
                        store = db::open_store(connection_type, &descriptor) => store,
                    }
                },
            )
            .await
    }
}

#[derive(Debug, Clone)]
struct Stamp {
    len: u64,
    modified: SystemTime,
    digest: String,
}

/// Content hashes of dataset files, recomputed only when a file's length or
/// modification time changes.
#[derive(Debug, Default)]
pub struct Fingerprinter {
    memo: DashMap<PathBuf, Stamp>,
}

impl Fingerprinter {
    /// SHA-256 of the file at `path`, hex encoded. A missing file has no
    /// fingerprint.
    pub async fn fingerprint(&self, path: &Path) -> AgentGraphResult<Option<String>> {
        let meta = match tokio::fs::metadata(path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.memo.remove(path);
                return Ok(None);
            }
            Err(e) => return Err(AgentGraphError::storage(path, e)),
        };
        let len = meta.len();
        let modified = meta
            .modified()
            .map_err(|e| AgentGraphError::storage(path, e))?;

        if let Some(stamp) = self.memo.get(path) {
            if stamp.len == len && stamp.modified == modified {
                return Ok(Some(stamp.digest.clone()));
            }
        }

        let digest = hash_file(path)
            .await
            .map_err(|e| AgentGraphError::storage(path, e))?;
        tracing::debug!(path = %path.display(), len, digest = %digest, "Dataset fingerprint computed");
        self.memo.insert(
            path.to_path_buf(),
            Stamp {
                len,
                modified,
                digest: digest.clone(),
            },
        );
        Ok(Some(digest))
    }
}

async fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ConfigPatch;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct Agent {
        model: String,
    }

    impl Footprint for Agent {}

    fn cache(root: &Path) -> ResultCache {
        ResultCache::new(
            Arc::new(ObjectRegistry::new(8)),
            SessionDirectoryAllocator::new(root),
            &CacheConfig::default(),
        )
    }

    #[test]
    fn test_derive_key_ignores_counters_and_timestamps() {
        let cache = cache(Path::new("/srv/sessions"));
        let mut session = Session::new("10.0.0.1");
        let before = cache.derive_key(&session, Some("abc".to_string()));

        session.total_queries = 12;
        session.last_query = Some("revenue by region".to_string());
        session.touch();
        assert_eq!(cache.derive_key(&session, Some("abc".to_string())), before);

        assert_ne!(cache.derive_key(&session, Some("def".to_string())), before);
        session.version += 1;
        assert_ne!(cache.derive_key(&session, Some("abc".to_string())), before);
    }

    #[test]
    fn test_descriptor_follows_connection_type() {
        let cache = cache(Path::new("/srv/sessions"));
        let mut session = Session::new("10.0.0.1");

        let key = cache.derive_key(&session, None);
        assert_eq!(
            key.connection_descriptor,
            format!("sqlite:///srv/sessions/{}/db.db", session.session_id)
        );

        session.config.apply(ConfigPatch {
            connection_type: Some(ConnectionType::Postgresql),
            db_uri: Some(Some("postgresql://bi:secret@db:5432/sales".to_string())),
            ..ConfigPatch::default()
        });
        let key = cache.derive_key(&session, None);
        assert_eq!(key.connection_descriptor, "postgresql://bi:secret@db:5432/sales");
        assert_eq!(key.connection_type, ConnectionType::Postgresql);
    }

    #[tokio::test]
    async fn test_configuration_change_rebuilds_agent() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = cache(tmp.path());
        let builds = Arc::new(AtomicUsize::new(0));
        let mut session = Session::new("10.0.0.1");

        let build = |model: String| {
            let builds = builds.clone();
            move |_: CancellationToken| async move {
                builds.fetch_add(1, Ordering::SeqCst);
                Ok::<_, BuildError>(Agent { model })
            }
        };

        let a = cache.agent(&session, None, build(session.config.selected_model.clone())).await.unwrap();
        let b = cache.agent(&session, None, build("unused".to_string())).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(builds.load(Ordering::SeqCst), 1);

        session.config.selected_model = "gpt-4o".to_string();
        session.version += 1;
        let c = cache.agent(&session, None, build(session.config.selected_model.clone())).await.unwrap();
        assert_eq!(c.model, "gpt-4o");
        assert_eq!(builds.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_sessions_never_share_agents() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = cache(tmp.path());
        let a = Session::new("10.0.0.1");
        let b = Session::new("10.0.0.1");

        let agent_a: Arc<Agent> = cache
            .agent(&a, None, |_| async { Ok(Agent { model: "a".to_string() }) })
            .await
            .unwrap();
        let agent_b: Arc<Agent> = cache
            .agent(&b, None, |_| async { Ok(Agent { model: "b".to_string() }) })
            .await
            .unwrap();

        assert!(!Arc::ptr_eq(&agent_a, &agent_b));
        assert_eq!(agent_b.model, "b");
        assert_eq!(cache.registry().session_entries(a.session_id), 1);
    }

    #[tokio::test]
    async fn test_open_store_is_cached_per_session() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = cache(tmp.path());
        let session = Session::new("10.0.0.1");

        let first = cache.open_store(&session).await.unwrap();
        let second = cache.open_store(&session).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(tmp.path().join(session.session_id.to_string()).join("db.db").exists());

        assert_eq!(cache.registry().evict_session(session.session_id), 1);
        first.close().await;
    }

    #[tokio::test]
    async fn test_postgres_without_uri_fails_to_build() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = cache(tmp.path());
        let mut session = Session::new("10.0.0.1");
        session.config.connection_type = ConnectionType::Postgresql;

        let err = cache.open_store(&session).await.unwrap_err();
        assert!(matches!(err, AgentGraphError::BuildFailed(BuildError::Failed(_))));
        assert_eq!(cache.registry().session_entries(session.session_id), 0);
    }

    #[tokio::test]
    async fn test_fingerprint_tracks_content() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("db.db");
        let fingerprints = Fingerprinter::default();

        assert_eq!(fingerprints.fingerprint(&path).await.unwrap(), None);

        std::fs::write(&path, b"region,revenue\nnorth,10\n").unwrap();
        let first = fingerprints.fingerprint(&path).await.unwrap().unwrap();
        assert_eq!(first.len(), 64);
        assert_eq!(fingerprints.fingerprint(&path).await.unwrap().as_deref(), Some(first.as_str()));

        std::fs::write(&path, b"region,revenue\nnorth,10\nsouth,20\n").unwrap();
        let second = fingerprints.fingerprint(&path).await.unwrap().unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_dataset_fingerprint_only_for_local_store() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = cache(tmp.path());
        let mut session = Session::new("10.0.0.1");

        let paths = SessionDirectoryAllocator::new(tmp.path())
            .paths_for(session.session_id)
            .await
            .unwrap();
        std::fs::write(&paths.store_file, b"data").unwrap();
        assert!(cache.dataset_fingerprint(&session).await.unwrap().is_some());

        session.config.db_uri = Some("sqlite:///elsewhere.db".to_string());
        assert!(cache.dataset_fingerprint(&session).await.unwrap().is_none());
    }
}
