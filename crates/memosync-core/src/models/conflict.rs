//! Sync conflict model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::models::{EntityKind, Record, RecordId};

/// What kind of divergence was detected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictKind {
    /// Both sides edited the record
    Update,
    /// One side deleted the record while the other edited it
    DeleteUpdate,
}

impl ConflictKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Update => "update",
            Self::DeleteUpdate => "delete-update",
        }
    }
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record that changed on both sides since the last sync
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    /// Same as the record id
    pub id: RecordId,
    pub entity_kind: EntityKind,
    /// `None` when the server deleted the record
    pub server_version: Option<Record>,
    pub local_version: Record,
    /// Last snapshot both sides agreed on, when known
    pub base_version: Option<Record>,
    pub kind: ConflictKind,
    /// Detection timestamp (Unix ms)
    pub detected_at: i64,
}

impl Conflict {
    /// Build a conflict, deriving its kind from the snapshots
    #[must_use]
    pub fn new(
        local_version: Record,
        server_version: Option<Record>,
        base_version: Option<Record>,
        detected_at: i64,
    ) -> Self {
        let server_deleted = server_version.as_ref().is_none_or(|server| server.is_deleted);
        let kind = if server_deleted || local_version.is_deleted {
            ConflictKind::DeleteUpdate
        } else {
            ConflictKind::Update
        };
        Self {
            id: local_version.id.clone(),
            entity_kind: local_version.entity_kind(),
            server_version,
            local_version,
            base_version,
            kind,
            detected_at,
        }
    }
}

/// Explicit user choice for an unresolved conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionChoice {
    /// Keep the local version and push it
    Local,
    /// Accept the server version
    Server,
    /// Accept the resolver's suggested merge
    MergeSuggestion,
}

impl ResolutionChoice {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Server => "server",
            Self::MergeSuggestion => "merge-suggestion",
        }
    }
}

impl FromStr for ResolutionChoice {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" | "keep-local" => Ok(Self::Local),
            "server" | "keep-server" => Ok(Self::Server),
            "merge" | "merge-suggestion" => Ok(Self::MergeSuggestion),
            other => Err(Error::InvalidInput(format!(
                "unknown resolution choice: {other} (expected local, server or merge)"
            ))),
        }
    }
}

/// How a conflict was (or would be) merged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeStrategy {
    /// Disjoint field sets merged
    Merge,
    /// Only tags overlapped; tag sets unioned
    MergeTags,
    /// Category field taken from the later version
    UseLatest,
    /// Base-aware merge preferring local values on overlap
    ThreeWay,
    /// Needs an explicit user choice
    Manual,
}

impl MergeStrategy {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Merge => "merge",
            Self::MergeTags => "merge-tags",
            Self::UseLatest => "use-latest",
            Self::ThreeWay => "three-way",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
