//! Remote API contract consumed by the sync engine

mod http;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{PendingOperation, Record, RecordId};

pub use http::HttpRemote;

/// Errors raised by a remote store
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// Connection-level failure; always worth retrying
    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// The server answered with a body we could not understand
    #[error("Invalid response payload: {0}")]
    InvalidPayload(String),
}

impl RemoteError {
    /// Network failures, 5xx and 408 are transient; everything else is terminal.
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Http { status, .. } => *status >= 500 || *status == 408,
            Self::InvalidPayload(_) => false,
        }
    }

    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            Self::Network(_) | Self::InvalidPayload(_) => None,
        }
    }
}

/// Server changes since a watermark
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullResponse {
    #[serde(default)]
    pub updated: Vec<Record>,
    #[serde(default)]
    pub deleted_ids: Vec<RecordId>,
    /// Server-issued high-water mark to resume the next pull from
    pub watermark: i64,
}

/// Why the server refused to apply a pushed operation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictDescriptor {
    /// Current server copy; `None` when the server deleted the record
    #[serde(default)]
    pub server_version: Option<Record>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Result of pushing one operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// The server stored the operation and returned its canonical copy
    Applied(Record),
    Conflict(ConflictDescriptor),
}

/// Remote side of synchronization
#[allow(async_fn_in_trait)]
pub trait RemoteStore {
    /// Fetch changes made after `since` (everything when `None`)
    async fn pull(&self, since: Option<i64>) -> Result<PullResponse, RemoteError>;

    /// Deliver one queued operation
    async fn push(&self, operation: &PendingOperation) -> Result<PushOutcome, RemoteError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http(status: u16) -> RemoteError {
        RemoteError::Http {
            status,
            message: String::new(),
        }
    }

    #[test]
    fn classifies_transient_errors() {
        assert!(RemoteError::Network("reset".into()).is_transient());
        assert!(http(503).is_transient());
        assert!(http(408).is_transient());
        assert!(!http(400).is_transient());
        assert!(!http(422).is_transient());
        assert!(!RemoteError::InvalidPayload("bad".into()).is_transient());
    }

    #[test]
    fn pull_response_defaults_missing_lists() {
        let response: PullResponse = serde_json::from_str(r#"{"watermark": 7}"#).unwrap();
        assert_eq!(
            response,
            PullResponse {
                watermark: 7,
                ..PullResponse::default()
            }
        );
    }
}
