/*
    record.rs - Materialized record view

    The flattened form of a record's merge state, as stored in the
    per-entity tables and handed to UI collaborators.
*/

use super::types::{EntityKind, RecordId, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Named scalar fields of a record
pub type FieldMap = BTreeMap<String, Value>;

/// Values that lost a concurrent merge, kept for user review
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictData {
    /// Losing values per conflicted field
    pub fields: BTreeMap<String, Vec<Value>>,
    /// Set when an update raced with a delete
    pub delete_conflict: bool,
}

impl ConflictData {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && !self.delete_conflict
    }
}

/// A record as seen by the rest of the application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Local auto-generated row key, absent until first stored
    pub local_id: Option<i64>,
    pub uuid: RecordId,
    pub entity: EntityKind,
    pub server_id: Option<String>,
    pub fields: FieldMap,
    pub media: Vec<String>,
    pub deleted: bool,
    pub synced: bool,
    pub conflict: bool,
    pub conflict_data: Option<ConflictData>,
    /// Time of the last local mutation
    pub timestamp: Timestamp,
}

impl Record {
    /// A new, never-stored record with a fresh identifier
    pub fn draft(entity: EntityKind, fields: FieldMap) -> Self {
        Record {
            local_id: None,
            uuid: RecordId::generate(),
            entity,
            server_id: None,
            fields,
            media: Vec::new(),
            deleted: false,
            synced: false,
            conflict: false,
            conflict_data: None,
            timestamp: Timestamp(0),
        }
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

/// How a flagged conflict should be settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Keep this device's side
    Local,
    /// Keep the other side
    Remote,
    /// Use caller-supplied merged fields
    Merge,
}

impl ResolutionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStrategy::Local => "local",
            ResolutionStrategy::Remote => "remote",
            ResolutionStrategy::Merge => "merge",
        }
    }
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResolutionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" | "keep_local" | "client_wins" => Ok(ResolutionStrategy::Local),
            "remote" | "keep_server" | "server_wins" => Ok(ResolutionStrategy::Remote),
            "merge" => Ok(ResolutionStrategy::Merge),
            other => Err(format!("unknown resolution strategy '{}'", other)),
        }
    }
}

/// Recursively merge `overlay` into `base`; overlay wins on leaf collisions
pub fn deep_merge(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            let mut out = base_map.clone();
            for (key, value) in overlay_map {
                let merged = match out.get(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value.clone(),
                };
                out.insert(key.clone(), merged);
            }
            Value::Object(out)
        }
        (_, overlay) => overlay.clone(),
    }
}
