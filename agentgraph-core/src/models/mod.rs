pub mod cache_key;
pub mod session;

pub use cache_key::{CacheKey, ObjectKind};
pub use session::{ConfigPatch, ConnectionType, InvalidSessionId, Session, SessionConfig, SessionId};
