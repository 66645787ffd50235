//! Pending operation model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{EntityKind, Record, RecordId};

/// Kind of local mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl OperationKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(Error::InvalidInput(format!("unknown operation kind: {other}"))),
        }
    }
}

/// Identifier of a queued operation: `<enqueued_at>-<entity>-<op>-<uuid>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(String);

impl OperationId {
    #[must_use]
    pub fn generate(enqueued_at: i64, entity_kind: EntityKind, kind: OperationKind) -> Self {
        Self(format!(
            "{enqueued_at}-{entity_kind}-{kind}-{}",
            Uuid::now_v7().simple()
        ))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for OperationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A durable, not yet delivered local mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingOperation {
    pub id: OperationId,
    pub kind: OperationKind,
    pub entity_kind: EntityKind,
    /// Snapshot of the record as written locally
    pub payload: Record,
    /// Enqueue timestamp (Unix ms)
    pub enqueued_at: i64,
    pub retry_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Earliest time of the next dispatch attempt (Unix ms)
    #[serde(default)]
    pub next_attempt_at: i64,
}

impl PendingOperation {
    #[must_use]
    pub fn new(kind: OperationKind, payload: Record, enqueued_at: i64) -> Self {
        let entity_kind = payload.entity_kind();
        Self {
            id: OperationId::generate(enqueued_at, entity_kind, kind),
            kind,
            entity_kind,
            payload,
            enqueued_at,
            retry_count: 0,
            last_error: None,
            next_attempt_at: enqueued_at,
        }
    }

    /// Id of the record this operation targets
    pub const fn record_id(&self) -> &RecordId {
        &self.payload.id
    }

    /// Whether the backoff window has elapsed at `now`
    pub const fn is_due(&self, now: i64) -> bool {
        self.next_attempt_at <= now
    }

    /// Whether the target id or any foreign key in the payload equals `id`
    pub fn references(&self, id: &RecordId) -> bool {
        self.payload.id == *id || self.payload.body.references(id)
    }

    /// A temporary id this operation cannot be pushed with yet.
    ///
    /// Only a create may carry its own temporary id; every other operation
    /// waits until the id is remapped to the server's.
    pub fn unsynced_reference(&self) -> Option<&RecordId> {
        if self.kind != OperationKind::Create && self.payload.id.is_temporary() {
            return Some(&self.payload.id);
        }
        self.payload
            .body
            .foreign_key()
            .filter(|id| id.is_temporary())
    }

    /// Rewrite every occurrence of `from` to `to`. Returns whether anything changed.
    pub fn remap(&mut self, from: &RecordId, to: &RecordId) -> bool {
        let mut changed = false;
        if self.payload.id == *from {
            self.payload.id = to.clone();
            changed = true;
        }
        changed |= self.payload.body.remap_reference(from, to);
        changed
    }
}
