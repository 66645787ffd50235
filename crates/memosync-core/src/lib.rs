//! memosync-core - Core library for memosync
//!
//! This crate contains the models, the durable local store, the offline
//! mutation queue and the conflict detection/resolution engine shared by all
//! memosync clients.

pub mod config;
pub mod db;
pub mod detector;
pub mod engine;
pub mod error;
pub mod events;
pub mod models;
pub mod queue;
pub mod remote;
pub mod resolver;
pub mod util;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::EngineConfig;
pub use db::{Database, LocalStore, RecordIndex, SqliteStore};
pub use engine::{CycleOutcome, CycleReport, SyncEngine, SyncPhase, SyncSummary};
pub use error::{Error, Result};
pub use events::{ConflictResolution, EventBus, OperationFailure, SyncEvent};
pub use models::{
    Category, Conflict, ConflictKind, EntityKind, MergeStrategy, Memo, OperationKind,
    PendingOperation, Record, RecordBody, RecordId, ResolutionChoice, SyncStatus,
};
pub use queue::{OfflineQueue, QueueReport, QueueRun};
pub use remote::{HttpRemote, PullResponse, PushOutcome, RemoteError, RemoteStore};
pub use resolver::Resolution;
