//! Scripted in-process remote for tests

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::db::SqliteStore;
use crate::models::{OperationKind, PendingOperation, Record, RecordId, SyncStatus};
use crate::remote::{ConflictDescriptor, PullResponse, PushOutcome, RemoteError, RemoteStore};
use crate::util::now_millis;

pub fn memory_store() -> Arc<SqliteStore> {
    Arc::new(SqliteStore::open_in_memory().unwrap())
}

#[derive(Default)]
struct FakeState {
    records: BTreeMap<RecordId, Record>,
    deleted: Vec<(RecordId, i64)>,
    clock: i64,
    next_id: u64,
    pushes: Vec<PendingOperation>,
    pulls: usize,
    fail_all: Option<RemoteError>,
    failures: HashMap<RecordId, RemoteError>,
    conflicts: HashSet<RecordId>,
    pull_error: Option<RemoteError>,
}

impl FakeState {
    fn tick(&mut self) -> i64 {
        self.clock = now_millis().max(self.clock + 1);
        self.clock
    }
}

/// Server double that assigns `real-N` ids and stamps its own clock
pub struct FakeRemote {
    state: Mutex<FakeState>,
}

impl Default for FakeRemote {
    fn default() -> Self {
        Self::with_first_id(1)
    }
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Canonical ids start at `real-{first}`
    pub fn with_first_id(first: u64) -> Self {
        Self {
            state: Mutex::new(FakeState {
                next_id: first,
                ..FakeState::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// Store a record server-side as if another client wrote it
    pub fn server_put(&self, mut record: Record) -> Record {
        let mut state = self.state();
        let ts = state.tick();
        record.updated_at = ts;
        record.sync_status = SyncStatus::Synced;
        record.last_sync_at = Some(ts);
        state.records.insert(record.id.clone(), record.clone());
        record
    }

    /// Edit an existing server record as another client would
    pub fn server_edit(&self, id: &RecordId, edit: impl FnOnce(&mut Record)) -> Record {
        let mut record = self.server_record(id).unwrap();
        edit(&mut record);
        record.sync_version += 1;
        self.server_put(record)
    }

    pub fn server_delete(&self, id: &RecordId) {
        let mut state = self.state();
        let ts = state.tick();
        state.records.remove(id);
        state.deleted.push((id.clone(), ts));
    }

    pub fn server_record(&self, id: &RecordId) -> Option<Record> {
        self.state().records.get(id).cloned()
    }

    pub fn server_records(&self) -> Vec<Record> {
        self.state().records.values().cloned().collect()
    }

    /// Fail every push with `error` until cleared with `None`
    pub fn fail_pushes(&self, error: Option<RemoteError>) {
        self.state().fail_all = error;
    }

    pub fn fail_pushes_for(&self, id: RecordId, error: RemoteError) {
        self.state().failures.insert(id, error);
    }

    pub fn clear_failures(&self) {
        let mut state = self.state();
        state.fail_all = None;
        state.failures.clear();
    }

    /// Answer pushes for `id` with a conflict descriptor
    pub fn conflict_on_push(&self, id: RecordId) {
        self.state().conflicts.insert(id);
    }

    pub fn fail_pull(&self, error: Option<RemoteError>) {
        self.state().pull_error = error;
    }

    pub fn pushes(&self) -> Vec<PendingOperation> {
        self.state().pushes.clone()
    }

    pub fn push_count(&self) -> usize {
        self.state().pushes.len()
    }

    pub fn pull_count(&self) -> usize {
        self.state().pulls
    }
}

impl RemoteStore for FakeRemote {
    async fn pull(&self, since: Option<i64>) -> Result<PullResponse, RemoteError> {
        tokio::task::yield_now().await;
        let mut state = self.state();
        state.pulls += 1;
        if let Some(error) = state.pull_error.clone() {
            return Err(error);
        }

        let since = since.unwrap_or(i64::MIN);
        Ok(PullResponse {
            updated: state
                .records
                .values()
                .filter(|record| record.updated_at > since)
                .cloned()
                .collect(),
            deleted_ids: state
                .deleted
                .iter()
                .filter(|(_, at)| *at > since)
                .map(|(id, _)| id.clone())
                .collect(),
            watermark: state.clock,
        })
    }

    async fn push(&self, operation: &PendingOperation) -> Result<PushOutcome, RemoteError> {
        tokio::task::yield_now().await;
        let mut state = self.state();
        state.pushes.push(operation.clone());

        let id = operation.record_id().clone();
        if let Some(error) = state.fail_all.clone() {
            return Err(error);
        }
        if let Some(error) = state.failures.get(&id).cloned() {
            return Err(error);
        }
        if state.conflicts.contains(&id) {
            return Ok(PushOutcome::Conflict(ConflictDescriptor {
                server_version: state.records.get(&id).cloned(),
                message: Some("stale version".into()),
            }));
        }

        let ts = state.tick();
        let mut record = operation.payload.clone();
        if operation.kind == OperationKind::Create && record.id.is_temporary() {
            record.id = RecordId::new(format!("real-{}", state.next_id));
            state.next_id += 1;
        }
        record.updated_at = ts;
        record.sync_status = SyncStatus::Synced;
        record.last_sync_at = Some(ts);

        if operation.kind == OperationKind::Delete {
            state.records.remove(&record.id);
            state.deleted.push((record.id.clone(), ts));
        } else {
            state.records.insert(record.id.clone(), record.clone());
        }
        Ok(PushOutcome::Applied(record))
    }
}
