//! Data models for memosync

mod conflict;
mod operation;
mod record;
mod sync_metadata;

pub use conflict::{Conflict, ConflictKind, MergeStrategy, ResolutionChoice};
pub use operation::{OperationId, OperationKind, PendingOperation};
pub use record::{
    extract_tags, Category, EntityKind, Field, Memo, Record, RecordBody, RecordId, SyncStatus,
    TEMP_ID_PREFIX,
};
pub use sync_metadata::SyncMetadata;
