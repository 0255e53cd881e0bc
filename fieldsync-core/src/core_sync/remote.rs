/*
    remote.rs - Boundary to the remote API

    The engine talks to the server only through the RemoteApi trait, so
    tests substitute an in-memory double and production uses HttpRemote.

    Wire format:
    - Materialized fields, media and tombstone for servers that store
      plain values
    - Optionally the full merge state for servers that keep it
    - `serverId` accepted as a string or a number
*/

use crate::core_store::crdt::RecordState;
use crate::core_store::model::{EntityKind, FieldMap, RecordId, ReferenceKind, Timestamp};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Failures reported by the remote boundary
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    /// 401 or no credential available; halts the push cycle
    #[error("Authorization failed: {0}")]
    Unauthorized(String),

    /// Connection, timeout or other I/O failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// 5xx
    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    /// Any other non-success status
    #[error("Request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// Success status with a body that could not be understood
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl RemoteError {
    pub fn is_auth(&self) -> bool {
        matches!(self, RemoteError::Unauthorized(_))
    }

    /// Worth retrying unchanged on the next cycle
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Transport(_) | RemoteError::Server { .. })
    }

    /// Classify a non-success HTTP status
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 => RemoteError::Unauthorized(message),
            500..=599 => RemoteError::Server { status, message },
            _ => RemoteError::Rejected { status, message },
        }
    }
}

pub type RemoteResult<T> = Result<T, RemoteError>;

fn deserialize_server_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Record body exchanged with the remote
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireRecord {
    #[serde(
        default,
        alias = "id",
        deserialize_with = "deserialize_server_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub server_id: Option<String>,
    #[serde(default)]
    pub uuid: Option<RecordId>,
    #[serde(default)]
    pub fields: FieldMap,
    #[serde(default)]
    pub media: Vec<String>,
    #[serde(default)]
    pub deleted: bool,
    /// Full merge state, when the server keeps it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<RecordState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl WireRecord {
    /// Body for a push, rebuilt from the current merge state
    pub fn from_state(state: &RecordState) -> Self {
        let record = state.materialize();
        WireRecord {
            server_id: record.server_id,
            uuid: Some(record.uuid),
            fields: record.fields,
            media: record.media,
            deleted: record.deleted,
            state: Some(state.clone()),
            updated_at: Some(record.timestamp.to_datetime()),
        }
    }

    /// Server change time in milliseconds, if the remote sent one
    pub fn updated_millis(&self) -> Option<u64> {
        self.updated_at.map(|t| Timestamp::from_datetime(t).as_millis())
    }
}

/// Everything the engine needs from the server
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Bulk create; the response lists created records with their server ids
    async fn create_batch(
        &self,
        entity: EntityKind,
        records: &[WireRecord],
    ) -> RemoteResult<Vec<WireRecord>>;

    /// Update by server id, or by client uuid when no server id exists yet
    async fn update(
        &self,
        entity: EntityKind,
        id: &str,
        record: &WireRecord,
    ) -> RemoteResult<Option<WireRecord>>;

    /// Delete; an unknown id counts as deleted
    async fn delete(&self, entity: EntityKind, id: &str) -> RemoteResult<()>;

    /// Records changed since the given time, or all records when None
    async fn changed_since(
        &self,
        entity: EntityKind,
        since: Option<Timestamp>,
    ) -> RemoteResult<Vec<WireRecord>>;

    /// One page of a reference collection
    async fn fetch_reference(
        &self,
        kind: ReferenceKind,
        page_size: usize,
    ) -> RemoteResult<Vec<Value>>;
}

/// Source of bearer credentials, owned by the host's auth subsystem
pub trait CredentialProvider: Send + Sync {
    fn bearer_token(&self) -> Option<String>;
}

/// Fixed token
#[derive(Debug, Clone)]
pub struct StaticToken(pub String);

impl CredentialProvider for StaticToken {
    fn bearer_token(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

/// Token read from an environment variable at request time
#[derive(Debug, Clone)]
pub struct EnvToken {
    pub var: String,
}

impl CredentialProvider for EnvToken {
    fn bearer_token(&self) -> Option<String> {
        std::env::var(&self.var).ok().filter(|t| !t.is_empty())
    }
}

/// Unwrap a collection response: a bare array, `{"data": [...]}` or
/// `{"result": {"data": [...]}}`
pub fn extract_items(body: Value) -> RemoteResult<Vec<Value>> {
    match body {
        Value::Array(items) => Ok(items),
        Value::Object(mut map) => {
            if let Some(Value::Array(items)) = map.remove("data") {
                return Ok(items);
            }
            match map.remove("result") {
                Some(result) => extract_items(result),
                None => Err(RemoteError::InvalidResponse(
                    "expected an array or a data envelope".to_string(),
                )),
            }
        }
        other => Err(RemoteError::InvalidResponse(format!(
            "expected an array, got {}",
            other
        ))),
    }
}

/// Decode a collection of records
pub fn decode_records(body: Value) -> RemoteResult<Vec<WireRecord>> {
    extract_items(body)?
        .into_iter()
        .map(|item| {
            serde_json::from_value(item).map_err(|e| RemoteError::InvalidResponse(e.to_string()))
        })
        .collect()
}
