//! Sync events broadcast to observers

use serde::Serialize;
use tokio::sync::broadcast;

use crate::engine::CycleReport;
use crate::models::{MergeStrategy, OperationId, RecordId, ResolutionChoice};

/// Why an operation left the queue without reaching the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "kebab-case")]
pub enum OperationFailure {
    /// Transient failures exceeded the retry budget
    RetryExhausted { attempts: u32, last_error: String },
    /// The server refused the operation
    Rejected {
        status: Option<u16>,
        message: String,
    },
    /// A record this operation points at never reached the server
    DependencyFailed { dependency: RecordId },
}

/// How a conflict left the conflict set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "by", content = "value", rename_all = "kebab-case")]
pub enum ConflictResolution {
    /// Merged automatically during a sync cycle
    Auto(MergeStrategy),
    /// Settled by an explicit user choice
    User(ResolutionChoice),
}

/// Observable engine events
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    QueueSizeChanged { pending: usize },
    CycleStarted,
    CycleCompleted { report: CycleReport },
    CycleFailed { reason: String },
    ConflictAdded { id: RecordId },
    ConflictResolved {
        id: RecordId,
        resolution: ConflictResolution,
    },
    OperationFailed {
        operation_id: OperationId,
        record_id: RecordId,
        failure: OperationFailure,
    },
}

/// Fan-out of `SyncEvent`s. Lagging receivers lose the oldest events.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// Publish an event; having no subscribers is not an error.
    pub fn emit(&self, event: SyncEvent) {
        tracing::trace!(?event, "sync event");
        let _ = self.sender.send(event);
    }
}
