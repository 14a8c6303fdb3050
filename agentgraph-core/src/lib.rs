pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod ipc;
pub mod kv;
pub mod models;
pub mod paths;
pub mod registry;
pub mod sessions;

pub use cache::{Fingerprinter, ResultCache};
pub use config::AgentGraphConfig;
pub use db::StoreConnection;
pub use error::{AgentGraphError, AgentGraphResult, BuildError};
pub use kv::{KvStore, MemoryKvStore, PgKvStore};
pub use models::{CacheKey, ConfigPatch, ObjectKind, Session, SessionConfig, SessionId};
pub use paths::{SessionDirectoryAllocator, SessionPaths};
pub use registry::{Footprint, ObjectRegistry, RegistryStats};
pub use sessions::{SessionRegistry, SessionStats};
