use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque session identifier. Always a canonical UUID, so it is also a safe
/// single path segment under the storage root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid session id: {0:?}")]
pub struct InvalidSessionId(pub String);

impl FromStr for SessionId {
    type Err = InvalidSessionId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = Uuid::parse_str(s).map_err(|_| InvalidSessionId(s.to_string()))?;
        // Only the lowercase hyphenated form round-trips to the directory name.
        if id.hyphenated().to_string() != s {
            return Err(InvalidSessionId(s.to_string()));
        }
        Ok(Self(id))
    }
}

impl From<Uuid> for SessionId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    #[default]
    Csv,
    Postgresql,
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Csv => f.write_str("csv"),
            Self::Postgresql => f.write_str("postgresql"),
        }
    }
}

/// Per-session agent configuration. Flat so it maps onto a single record in
/// the session store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub tenant_id: String,
    pub selected_model: String,
    pub top_k: u32,
    pub connection_type: ConnectionType,
    pub db_uri: Option<String>,
    pub single_table_mode: bool,
    pub selected_table: Option<String>,
    pub advanced_mode: bool,
    pub processing_enabled: bool,
    pub processing_model: String,
    pub question_refinement_enabled: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tenant_id: "default".to_string(),
            selected_model: "gpt-4o-mini".to_string(),
            top_k: 10,
            connection_type: ConnectionType::Csv,
            db_uri: None,
            single_table_mode: false,
            selected_table: None,
            advanced_mode: false,
            processing_enabled: false,
            processing_model: "gpt-4o-mini".to_string(),
            question_refinement_enabled: false,
        }
    }
}

impl SessionConfig {
    /// Table-selection filter: the selected table in single-table mode,
    /// otherwise every table.
    pub fn table_filter(&self) -> &str {
        match (&self.selected_table, self.single_table_mode) {
            (Some(table), true) => table,
            _ => "*",
        }
    }

    pub fn apply(&mut self, patch: ConfigPatch) {
        let ConfigPatch {
            tenant_id,
            selected_model,
            top_k,
            connection_type,
            db_uri,
            single_table_mode,
            selected_table,
            advanced_mode,
            processing_enabled,
            processing_model,
            question_refinement_enabled,
        } = patch;

        if let Some(v) = tenant_id {
            self.tenant_id = v;
        }
        if let Some(v) = selected_model {
            self.selected_model = v;
        }
        if let Some(v) = top_k {
            self.top_k = v;
        }
        if let Some(v) = connection_type {
            self.connection_type = v;
        }
        if let Some(v) = db_uri {
            self.db_uri = v;
        }
        if let Some(v) = single_table_mode {
            self.single_table_mode = v;
        }
        if let Some(v) = selected_table {
            self.selected_table = v;
        }
        if let Some(v) = advanced_mode {
            self.advanced_mode = v;
        }
        if let Some(v) = processing_enabled {
            self.processing_enabled = v;
        }
        if let Some(v) = processing_model {
            self.processing_model = v;
        }
        if let Some(v) = question_refinement_enabled {
            self.question_refinement_enabled = v;
        }
    }
}

/// Partial configuration update. Nullable fields use a nested `Option` so a
/// patch can distinguish "leave alone" from "clear".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigPatch {
    pub tenant_id: Option<String>,
    pub selected_model: Option<String>,
    pub top_k: Option<u32>,
    pub connection_type: Option<ConnectionType>,
    #[serde(with = "double_option", skip_serializing_if = "Option::is_none")]
    pub db_uri: Option<Option<String>>,
    pub single_table_mode: Option<bool>,
    #[serde(with = "double_option", skip_serializing_if = "Option::is_none")]
    pub selected_table: Option<Option<String>>,
    pub advanced_mode: Option<bool>,
    pub processing_enabled: Option<bool>,
    pub processing_model: Option<String>,
    pub question_refinement_enabled: Option<bool>,
}

mod double_option {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S, T>(value: &Option<Option<T>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: Serialize,
    {
        match value {
            Some(inner) => inner.serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    // A present key (even `null`) deserializes to `Some(..)`; an absent key
    // falls back to the field default, `None`.
    pub fn deserialize<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
    where
        D: Deserializer<'de>,
        T: Deserialize<'de>,
    {
        Option::<T>::deserialize(deserializer).map(Some)
    }
}

/// The session record held in the TTL store under `session:{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: SessionId,
    pub client_id: String,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub version: u64,
    #[serde(flatten)]
    pub config: SessionConfig,
    pub total_queries: u64,
    pub last_query: Option<String>,
    pub session_size_bytes: u64,
}

impl Session {
    pub fn new(client_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: SessionId::new(),
            client_id: client_id.into(),
            created_at: now,
            last_seen: now,
            version: 1,
            config: SessionConfig::default(),
            total_queries: 0,
            last_query: None,
            session_size_bytes: 0,
        }
    }

    /// Advance `last_seen`, never moving it backwards.
    pub fn touch(&mut self) {
        self.last_seen = self.last_seen.max(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_roundtrips_through_display() {
        let id = SessionId::new();
        let parsed: SessionId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_session_id_rejects_path_like_input() {
        assert!("../etc".parse::<SessionId>().is_err());
        assert!("".parse::<SessionId>().is_err());
        // simple (unhyphenated) form never names a session directory
        let simple = Uuid::new_v4().simple().to_string();
        assert!(simple.parse::<SessionId>().is_err());
    }

    #[test]
    fn test_session_id_rejects_uppercase() {
        let id = SessionId::new();
        let upper = id.to_string().to_ascii_uppercase();
        assert!(upper.parse::<SessionId>().is_err());
        assert_eq!(id.to_string().parse::<SessionId>().unwrap(), id);
    }

    #[test]
    fn test_table_filter_requires_single_table_mode() {
        let mut config = SessionConfig {
            selected_table: Some("sales".to_string()),
            ..SessionConfig::default()
        };
        assert_eq!(config.table_filter(), "*");

        config.single_table_mode = true;
        assert_eq!(config.table_filter(), "sales");
    }

    #[test]
    fn test_patch_can_clear_nullable_fields() {
        let mut config = SessionConfig {
            db_uri: Some("sqlite:///tmp/a.db".to_string()),
            ..SessionConfig::default()
        };

        let patch: ConfigPatch = serde_json::from_value(serde_json::json!({
            "db_uri": null,
            "top_k": 25
        }))
        .unwrap();
        config.apply(patch);

        assert_eq!(config.db_uri, None);
        assert_eq!(config.top_k, 25);
        assert_eq!(config.selected_model, "gpt-4o-mini");
    }

    #[test]
    fn test_absent_patch_fields_leave_config_alone() {
        let mut config = SessionConfig {
            db_uri: Some("sqlite:///tmp/a.db".to_string()),
            ..SessionConfig::default()
        };
        let patch: ConfigPatch = serde_json::from_value(serde_json::json!({})).unwrap();
        config.apply(patch);
        assert_eq!(config.db_uri.as_deref(), Some("sqlite:///tmp/a.db"));
    }

    #[test]
    fn test_session_record_is_flat() {
        let session = Session::new("10.0.0.1");
        let value = serde_json::to_value(&session).unwrap();
        assert_eq!(value["selected_model"], "gpt-4o-mini");
        assert_eq!(value["version"], 1);
        assert!(value.get("config").is_none());

        let back: Session = serde_json::from_value(value).unwrap();
        assert_eq!(back, session);
    }
}
