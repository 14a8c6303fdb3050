use std::sync::Arc;

use agentgraph_core::{
    AgentGraphConfig, KvStore, ObjectRegistry, ResultCache, SessionDirectoryAllocator,
    SessionRegistry,
};

use crate::subsystems::sweeper::LifecycleSweeper;

/// Everything a request handler needs. One instance per process, shared by
/// the HTTP API, the IPC server and the sweep loop.
pub struct AppState {
    pub config: AgentGraphConfig,
    pub sessions: Arc<SessionRegistry>,
    pub directories: SessionDirectoryAllocator,
    pub objects: Arc<ObjectRegistry>,
    pub cache: Arc<ResultCache>,
    pub sweeper: Arc<LifecycleSweeper>,
}

impl AppState {
    pub fn new(config: AgentGraphConfig, store: Arc<dyn KvStore>) -> Self {
        let directories = SessionDirectoryAllocator::from_config(&config.storage);
        Self::with_directories(config, store, directories)
    }

    /// Same as `new` with an explicit session root.
    pub fn with_directories(
        config: AgentGraphConfig,
        store: Arc<dyn KvStore>,
        directories: SessionDirectoryAllocator,
    ) -> Self {
        let sessions = Arc::new(SessionRegistry::new(store, &config.sessions));
        let objects = Arc::new(ObjectRegistry::new(config.cache.max_entries_per_session));
        let cache = Arc::new(ResultCache::new(
            objects.clone(),
            directories.clone(),
            &config.cache,
        ));
        let sweeper = Arc::new(LifecycleSweeper::new(
            sessions.clone(),
            objects.clone(),
            directories.clone(),
            &config.sweeper,
        ));

        Self {
            config,
            sessions,
            directories,
            objects,
            cache,
            sweeper,
        }
    }
}
