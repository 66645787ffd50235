//! Offline mutation queue
//!
//! Local writes are recorded as `PendingOperation`s in the durable store and
//! delivered to the remote in enqueue order. Delivery is single-flight: a pass
//! that starts while another one is running returns `QueueRun::Busy` instead
//! of waiting.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;

use crate::config::EngineConfig;
use crate::db::LocalStore;
use crate::error::{Error, Result};
use crate::events::{EventBus, OperationFailure, SyncEvent};
use crate::models::{
    Conflict, EntityKind, OperationId, OperationKind, PendingOperation, Record, RecordId,
    SyncStatus,
};
use crate::remote::{ConflictDescriptor, PushOutcome, RemoteError, RemoteStore};
use crate::util::now_millis;

/// Tally of one or more queue passes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueReport {
    /// Operations sent to the remote
    pub attempted: usize,
    pub applied: usize,
    /// Pushes the server refused with a conflict
    pub conflicts: usize,
    /// Transient failures rescheduled with backoff
    pub retried: usize,
    /// Operations dropped after a terminal failure
    pub evicted: usize,
    /// Operations skipped this pass: open conflict, backoff, a temporary id not yet
    /// on the server, or an earlier operation that did not get through
    pub held: usize,
    /// Temporary ids replaced by canonical ones
    pub remapped: usize,
    /// Earliest scheduled retry, if any operation is waiting on backoff
    pub next_retry_at: Option<i64>,
}

impl QueueReport {
    fn absorb(&mut self, pass: &Self) {
        self.attempted += pass.attempted;
        self.applied += pass.applied;
        self.conflicts += pass.conflicts;
        self.retried += pass.retried;
        self.evicted += pass.evicted;
        self.remapped += pass.remapped;
        self.held = pass.held;
        self.next_retry_at = pass.next_retry_at;
    }

    fn schedule(&mut self, at: i64) {
        self.next_retry_at = Some(self.next_retry_at.map_or(at, |current| current.min(at)));
    }
}

/// What became of an operation after a transient failure
enum Retry {
    At(i64),
    /// Budget spent; counts every operation evicted with it
    Evicted(usize),
}

/// Result of asking the queue to deliver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueRun {
    /// Another pass was already in flight
    Busy,
    Completed(QueueReport),
}

/// Clears the busy flag when a pass ends, including on early return
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Durable, ordered queue of local mutations awaiting delivery
pub struct OfflineQueue<S> {
    store: Arc<S>,
    config: EngineConfig,
    events: EventBus,
    pending: watch::Sender<Vec<PendingOperation>>,
    processing: AtomicBool,
}

impl<S: LocalStore> OfflineQueue<S> {
    /// Create a queue, restoring the operation log from the store
    pub fn new(store: Arc<S>, config: EngineConfig, events: EventBus) -> Result<Self> {
        let operations = store.operations()?;
        if !operations.is_empty() {
            tracing::info!("Restored {} queued operations", operations.len());
        }
        let (pending, _) = watch::channel(operations);

        Ok(Self {
            store,
            config,
            events,
            pending,
            processing: AtomicBool::new(false),
        })
    }

    /// Record a local mutation.
    ///
    /// The record is written locally as pending (deletes as a pending
    /// tombstone) and the operation appended to the log. Nothing touches the
    /// network.
    pub fn enqueue(
        &self,
        kind: OperationKind,
        entity_kind: EntityKind,
        mut payload: Record,
    ) -> Result<PendingOperation> {
        if payload.entity_kind() != entity_kind {
            return Err(Error::InvalidInput(format!(
                "payload is a {} but the operation targets a {entity_kind}",
                payload.entity_kind()
            )));
        }
        if kind == OperationKind::Delete {
            payload.is_deleted = true;
        } else {
            payload.body.validate()?;
        }

        let stored = self.store.save(&payload, SyncStatus::Pending)?;

        let now = now_millis();
        let enqueued_at = self
            .pending
            .borrow()
            .last()
            .map_or(now, |last| now.max(last.enqueued_at));
        let operation = PendingOperation::new(kind, stored, enqueued_at);
        self.store.append_operation(&operation)?;
        self.pending.send_modify(|ops| ops.push(operation.clone()));

        tracing::debug!(
            "Queued {} {} for {}",
            operation.kind,
            operation.entity_kind,
            operation.record_id()
        );
        self.emit_size();
        Ok(operation)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.borrow().len()
    }

    /// Snapshot of the operation log in delivery order
    pub fn pending(&self) -> Vec<PendingOperation> {
        self.pending.borrow().clone()
    }

    /// Read-only live view of the operation log
    pub fn subscribe(&self) -> watch::Receiver<Vec<PendingOperation>> {
        self.pending.subscribe()
    }

    /// Whether any queued operation targets `id`
    pub fn has_pending_for(&self, id: &RecordId) -> bool {
        self.pending.borrow().iter().any(|op| op.record_id() == id)
    }

    /// Drop every queued operation targeting `record_id`
    pub fn discard_for(&self, record_id: &RecordId) -> Result<usize> {
        let doomed = self
            .pending
            .borrow()
            .iter()
            .filter(|op| op.record_id() == record_id)
            .map(|op| op.id.clone())
            .collect::<Vec<_>>();
        if doomed.is_empty() {
            return Ok(0);
        }

        for id in &doomed {
            self.store.remove_operation(id)?;
        }
        self.pending
            .send_modify(|ops| ops.retain(|op| !doomed.contains(&op.id)));
        tracing::debug!("Discarded {} operations for {record_id}", doomed.len());
        self.emit_size();
        Ok(doomed.len())
    }

    /// Run one delivery pass over the log
    pub async fn process_queue<R: RemoteStore>(&self, remote: &R) -> Result<QueueRun> {
        if self
            .processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("Queue pass already running");
            return Ok(QueueRun::Busy);
        }
        let _guard = BusyGuard(&self.processing);

        let report = self.run_pass(remote).await?;
        Ok(QueueRun::Completed(report))
    }

    /// Run passes until nothing is waiting on backoff, sleeping until the
    /// earliest scheduled retry in between. Stops early once `keep_running`
    /// returns false.
    pub async fn flush<R, F>(&self, remote: &R, keep_running: F) -> Result<QueueRun>
    where
        R: RemoteStore,
        F: Fn() -> bool,
    {
        let mut total = QueueReport::default();
        let mut first = true;

        loop {
            let pass = match self.process_queue(remote).await? {
                QueueRun::Busy if first => return Ok(QueueRun::Busy),
                QueueRun::Busy => break,
                QueueRun::Completed(pass) => pass,
            };
            first = false;
            total.absorb(&pass);

            let Some(next_retry_at) = pass.next_retry_at else {
                break;
            };
            if !keep_running() {
                break;
            }

            let wait = u64::try_from(next_retry_at - now_millis()).unwrap_or(0);
            tracing::debug!("Waiting {wait}ms for the next retry");
            tokio::time::sleep(Duration::from_millis(wait)).await;
        }

        Ok(QueueRun::Completed(total))
    }

    async fn run_pass<R: RemoteStore>(&self, remote: &R) -> Result<QueueReport> {
        let mut report = QueueReport::default();
        // Ids whose earlier operations did not get through this pass
        let mut blocked: HashSet<RecordId> = HashSet::new();

        let ids = self
            .pending
            .borrow()
            .iter()
            .map(|op| op.id.clone())
            .collect::<Vec<_>>();

        for id in ids {
            // Earlier iterations may have rewritten or removed it
            let Some(operation) = self.find(&id) else {
                continue;
            };
            let record_id = operation.record_id().clone();

            if blocked.iter().any(|blocked_id| operation.references(blocked_id)) {
                blocked.insert(record_id);
                report.held += 1;
                continue;
            }
            if let Some(unknown) = operation.unsynced_reference() {
                tracing::debug!("Holding {} until {unknown} reaches the server", operation.id);
                blocked.insert(record_id);
                report.held += 1;
                continue;
            }
            if self.store.get_conflict(&record_id)?.is_some() {
                blocked.insert(record_id);
                report.held += 1;
                continue;
            }
            if !operation.is_due(now_millis()) {
                report.schedule(operation.next_attempt_at);
                blocked.insert(record_id);
                report.held += 1;
                continue;
            }

            report.attempted += 1;
            tracing::debug!(
                "Pushing {} {} for {} (attempt {})",
                operation.kind,
                operation.entity_kind,
                record_id,
                operation.retry_count + 1
            );

            match remote.push(&operation).await {
                Ok(PushOutcome::Applied(record)) => {
                    if self.on_applied(&operation, record)? {
                        report.remapped += 1;
                    }
                    report.applied += 1;
                }
                Ok(PushOutcome::Conflict(descriptor)) => {
                    self.on_conflict(&operation, descriptor)?;
                    blocked.insert(record_id);
                    report.conflicts += 1;
                }
                Err(error) if error.is_transient() => {
                    match self.on_transient(operation, &error)? {
                        Retry::At(retry_at) => {
                            report.schedule(retry_at);
                            report.retried += 1;
                        }
                        Retry::Evicted(count) => report.evicted += count,
                    }
                    blocked.insert(record_id);
                }
                Err(error) => {
                    report.evicted += self.evict(
                        &operation,
                        OperationFailure::Rejected {
                            status: error.status(),
                            message: error.to_string(),
                        },
                    )?;
                    blocked.insert(record_id);
                }
            }
        }

        if report.attempted > 0 {
            tracing::info!(
                "Queue pass: {} applied, {} conflicts, {} retried, {} evicted, {} held",
                report.applied,
                report.conflicts,
                report.retried,
                report.evicted,
                report.held
            );
        }
        Ok(report)
    }

    fn find(&self, id: &OperationId) -> Option<PendingOperation> {
        self.pending.borrow().iter().find(|op| op.id == *id).cloned()
    }

    fn remove(&self, operation: &PendingOperation) -> Result<()> {
        self.store.remove_operation(&operation.id)?;
        self.pending
            .send_modify(|ops| ops.retain(|op| op.id != operation.id));
        self.emit_size();
        Ok(())
    }

    /// Settle a delivered operation. Returns whether a temporary id was replaced.
    fn on_applied(&self, operation: &PendingOperation, canonical: Record) -> Result<bool> {
        self.remove(operation)?;

        let local_id = operation.record_id();
        let remapped = canonical.id != *local_id;
        if remapped {
            self.remap(local_id, &canonical.id)?;
        }

        if operation.kind == OperationKind::Delete {
            self.store.delete(&canonical.id)?;
        } else if self.has_pending_for(&canonical.id) {
            // Later local edits stay pending; only the agreed snapshot moves
            self.store.save_base(&canonical)?;
        } else {
            self.store.save(&canonical, SyncStatus::Synced)?;
        }
        Ok(remapped)
    }

    /// Replace `from` with `to` in the store and in every queued operation
    fn remap(&self, from: &RecordId, to: &RecordId) -> Result<()> {
        self.store.remap_record_id(from, to)?;

        let mut operations = self.pending.borrow().clone();
        let mut rewritten = 0;
        for operation in &mut operations {
            if operation.remap(from, to) {
                self.store.update_operation(operation)?;
                rewritten += 1;
            }
        }
        self.pending.send_replace(operations);

        tracing::info!("Server assigned {to} to {from}; rewrote {rewritten} queued operations");
        Ok(())
    }

    fn on_conflict(&self, operation: &PendingOperation, descriptor: ConflictDescriptor) -> Result<()> {
        self.remove(operation)?;

        let local = self
            .store
            .get(operation.record_id())?
            .unwrap_or_else(|| operation.payload.clone());
        let base = self.store.base(&local.id)?;
        let conflict = Conflict::new(local, descriptor.server_version, base, now_millis());

        self.store.save_conflict(&conflict)?;
        self.store.save(&conflict.local_version, SyncStatus::Conflict)?;

        tracing::warn!(
            "Server rejected {} for {} with a conflict: {}",
            operation.kind,
            conflict.id,
            descriptor.message.as_deref().unwrap_or("no details")
        );
        self.events
            .emit(SyncEvent::ConflictAdded { id: conflict.id });
        Ok(())
    }

    /// Reschedule after a transient failure, or evict once the retry budget
    /// is spent
    fn on_transient(&self, mut operation: PendingOperation, error: &RemoteError) -> Result<Retry> {
        if operation.retry_count >= self.config.max_retries {
            let evicted = self.evict(
                &operation,
                OperationFailure::RetryExhausted {
                    attempts: operation.retry_count + 1,
                    last_error: error.to_string(),
                },
            )?;
            return Ok(Retry::Evicted(evicted));
        }

        let delay = self.config.backoff_delay(operation.retry_count);
        let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
        operation.retry_count += 1;
        operation.last_error = Some(error.to_string());
        operation.next_attempt_at = now_millis().saturating_add(delay_ms);

        self.store.update_operation(&operation)?;
        let retry_at = operation.next_attempt_at;
        tracing::warn!(
            "Push of {} failed ({error}); retry {} of {} in {delay_ms}ms",
            operation.record_id(),
            operation.retry_count,
            self.config.max_retries
        );
        self.pending.send_modify(|ops| {
            if let Some(slot) = ops.iter_mut().find(|op| op.id == operation.id) {
                *slot = operation;
            }
        });
        Ok(Retry::At(retry_at))
    }

    /// Drop an operation for good. Returns how many operations left the queue.
    ///
    /// A failed create of a temporary id takes every operation pointing at
    /// that id with it, and the local record becomes a conflict with no
    /// server copy.
    fn evict(&self, operation: &PendingOperation, failure: OperationFailure) -> Result<usize> {
        self.remove(operation)?;
        tracing::warn!(
            "Dropped {} {} for {}: {failure:?}",
            operation.kind,
            operation.entity_kind,
            operation.record_id()
        );
        self.events.emit(SyncEvent::OperationFailed {
            operation_id: operation.id.clone(),
            record_id: operation.record_id().clone(),
            failure,
        });

        let id = operation.record_id();
        if operation.kind != OperationKind::Create || !id.is_temporary() {
            return Ok(1);
        }
        // Later edits of the record itself live on in the local copy
        self.discard_for(id)?;
        let dependents = self.evict_dependents(id)?;
        self.flag_orphan(id)?;
        Ok(1 + dependents)
    }

    /// Evict every queued operation whose payload points at `id`.
    /// Returns how many operations left the queue, cascades included.
    pub fn evict_dependents(&self, id: &RecordId) -> Result<usize> {
        let dependents = self
            .pending
            .borrow()
            .iter()
            .filter(|op| op.payload.body.references(id))
            .map(|op| op.id.clone())
            .collect::<Vec<_>>();

        let mut evicted = 0;
        for operation_id in dependents {
            let Some(operation) = self.find(&operation_id) else {
                continue;
            };
            evicted += self.evict(
                &operation,
                OperationFailure::DependencyFailed {
                    dependency: id.clone(),
                },
            )?;
        }
        Ok(evicted)
    }

    /// Turn a record the server never accepted into a conflict with no
    /// server copy, so the user can keep (re-create) or drop it
    fn flag_orphan(&self, id: &RecordId) -> Result<()> {
        let Some(local) = self.store.get(id)? else {
            return Ok(());
        };
        if local.is_deleted {
            self.store.delete(id)?;
            return Ok(());
        }

        let conflict = Conflict::new(local, None, None, now_millis());
        self.store.save_conflict(&conflict)?;
        self.store.save(&conflict.local_version, SyncStatus::Conflict)?;
        tracing::warn!(
            "{} {} never reached the server and needs a decision",
            conflict.entity_kind,
            conflict.id
        );
        self.events
            .emit(SyncEvent::ConflictAdded { id: conflict.id });
        Ok(())
    }

    fn emit_size(&self) {
        self.events.emit(SyncEvent::QueueSizeChanged {
            pending: self.pending_count(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteStore;
    use crate::models::{Category, Memo, RecordBody};
    use crate::test_support::{memory_store, FakeRemote};
    use pretty_assertions::assert_eq;
    use tokio::sync::broadcast;

    fn queue_with(store: Arc<SqliteStore>, config: EngineConfig) -> OfflineQueue<SqliteStore> {
        OfflineQueue::new(store, config, EventBus::new(64)).unwrap()
    }

    fn instant_retries() -> EngineConfig {
        EngineConfig {
            base_retry_delay_ms: 0,
            ..EngineConfig::default()
        }
    }

    fn memo(title: &str) -> Record {
        Record::new(RecordBody::Memo(Memo::new(title, "body")))
    }

    fn completed(run: QueueRun) -> QueueReport {
        match run {
            QueueRun::Completed(report) => report,
            QueueRun::Busy => panic!("queue unexpectedly busy"),
        }
    }

    fn drain(rx: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[test]
    fn enqueue_persists_record_and_operation() {
        let store = memory_store();
        let queue = queue_with(store.clone(), EngineConfig::default());
        let mut events = queue.events.subscribe();

        let record = memo("Offline");
        let op = queue
            .enqueue(OperationKind::Create, EntityKind::Memo, record.clone())
            .unwrap();

        assert_eq!(queue.pending_count(), 1);
        assert_eq!(store.operations().unwrap(), vec![op]);
        assert_eq!(
            store.get(&record.id).unwrap().unwrap().sync_status,
            SyncStatus::Pending
        );
        assert_eq!(
            drain(&mut events),
            vec![SyncEvent::QueueSizeChanged { pending: 1 }]
        );
    }

    #[test]
    fn enqueue_rejects_mismatched_kind_and_invalid_body() {
        let queue = queue_with(memory_store(), EngineConfig::default());
        assert!(queue
            .enqueue(OperationKind::Create, EntityKind::Category, memo("A"))
            .is_err());

        let bad = Record::new(RecordBody::Category(Category::new("Work", "blue")));
        assert!(queue
            .enqueue(OperationKind::Create, EntityKind::Category, bad)
            .is_err());
        assert_eq!(queue.pending_count(), 0);
    }

    #[test]
    fn queue_restores_log_on_restart() {
        let store = memory_store();
        let first = queue_with(store.clone(), EngineConfig::default());
        first
            .enqueue(OperationKind::Create, EntityKind::Memo, memo("A"))
            .unwrap();
        first
            .enqueue(OperationKind::Create, EntityKind::Memo, memo("B"))
            .unwrap();

        let restored = queue_with(store, EngineConfig::default());
        assert_eq!(restored.pending(), first.pending());
    }

    #[tokio::test]
    async fn applied_create_is_stored_as_synced() {
        let store = memory_store();
        let queue = queue_with(store.clone(), EngineConfig::default());
        let remote = FakeRemote::new();

        let record = memo("Hello");
        queue
            .enqueue(OperationKind::Create, EntityKind::Memo, record.clone())
            .unwrap();
        let report = completed(queue.process_queue(&remote).await.unwrap());

        assert_eq!(report.applied, 1);
        assert_eq!(report.remapped, 1);
        assert_eq!(queue.pending_count(), 0);
        assert!(store.get(&record.id).unwrap().is_none());

        let synced = store.get(&RecordId::new("real-1")).unwrap().unwrap();
        assert_eq!(synced.sync_status, SyncStatus::Synced);
        assert!(store.base(&synced.id).unwrap().is_some());
    }

    #[tokio::test]
    async fn temp_id_rewritten_in_queued_operations() {
        let store = memory_store();
        let queue = queue_with(store.clone(), EngineConfig::default());
        let remote = FakeRemote::with_first_id(42);

        let category = Record::with_id(
            RecordId::new("temp-1"),
            RecordBody::Category(Category::new("Work", "#336699")),
        );
        let filed = Record::with_id(
            RecordId::new("temp-2"),
            RecordBody::Memo(Memo::new("Filed", "x").with_category(category.id.clone())),
        );
        queue
            .enqueue(OperationKind::Create, EntityKind::Category, category)
            .unwrap();
        queue
            .enqueue(OperationKind::Create, EntityKind::Memo, filed.clone())
            .unwrap();
        remote.fail_pushes_for(filed.id.clone(), RemoteError::Network("flaky".into()));

        completed(queue.process_queue(&remote).await.unwrap());

        let real = RecordId::new("real-42");
        let temp = RecordId::new("temp-1");
        let remaining = queue.pending();
        assert_eq!(remaining.len(), 1);
        assert!(remaining.iter().all(|op| !op.references(&temp)));
        assert_eq!(
            remaining[0].payload.memo().unwrap().category_id.as_ref(),
            Some(&real)
        );
        assert_eq!(store.operations().unwrap(), remaining);

        let local = store.get(&filed.id).unwrap().unwrap();
        assert_eq!(local.memo().unwrap().category_id.as_ref(), Some(&real));
    }

    #[tokio::test]
    async fn operations_depending_on_undelivered_create_are_held() {
        let queue = queue_with(memory_store(), EngineConfig::default());
        let remote = FakeRemote::new();

        let category = Record::with_id(
            RecordId::new("temp-1"),
            RecordBody::Category(Category::new("Work", "#336699")),
        );
        let filed = Record::new(RecordBody::Memo(
            Memo::new("Filed", "x").with_category(category.id.clone()),
        ));
        queue
            .enqueue(OperationKind::Create, EntityKind::Category, category.clone())
            .unwrap();
        queue
            .enqueue(OperationKind::Create, EntityKind::Memo, filed)
            .unwrap();
        remote.fail_pushes_for(category.id, RemoteError::Network("down".into()));

        let report = completed(queue.process_queue(&remote).await.unwrap());

        assert_eq!(report.attempted, 1);
        assert_eq!(report.held, 1);
        assert_eq!(remote.push_count(), 1);
    }

    #[tokio::test]
    async fn same_record_operations_deliver_in_order() {
        let store = memory_store();
        let queue = queue_with(store.clone(), EngineConfig::default());
        let remote = FakeRemote::new();

        let mut record = Record::with_id(
            RecordId::new("real-9"),
            RecordBody::Memo(Memo::new("v1", "body")),
        );
        queue
            .enqueue(OperationKind::Update, EntityKind::Memo, record.clone())
            .unwrap();
        record.touch();
        record.body = RecordBody::Memo(Memo::new("v2", "body"));
        queue
            .enqueue(OperationKind::Update, EntityKind::Memo, record.clone())
            .unwrap();

        let report = completed(queue.process_queue(&remote).await.unwrap());
        assert_eq!(report.applied, 2);

        let pushed_titles = remote
            .pushes()
            .iter()
            .map(|op| op.payload.memo().unwrap().title.clone())
            .collect::<Vec<_>>();
        assert_eq!(pushed_titles, vec!["v1", "v2"]);

        let stored = store.get(&record.id).unwrap().unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Synced);
        assert_eq!(stored.memo().unwrap().title, "v2");
    }

    #[tokio::test]
    async fn applied_operation_with_later_edit_only_moves_base() {
        let store = memory_store();
        let queue = queue_with(store.clone(), EngineConfig::default());
        let remote = FakeRemote::new();

        let mut record = Record::with_id(
            RecordId::new("real-9"),
            RecordBody::Memo(Memo::new("v1", "body")),
        );
        queue
            .enqueue(OperationKind::Update, EntityKind::Memo, record.clone())
            .unwrap();
        record.touch();
        record.body = RecordBody::Memo(Memo::new("v2", "body"));
        queue
            .enqueue(OperationKind::Update, EntityKind::Memo, record.clone())
            .unwrap();

        // Settle only the first operation
        let first = queue.pending()[0].clone();
        let outcome = remote.push(&first).await.unwrap();
        let PushOutcome::Applied(canonical) = outcome else {
            panic!("expected applied");
        };
        queue.on_applied(&first, canonical).unwrap();

        let stored = store.get(&record.id).unwrap().unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Pending);
        assert_eq!(stored.memo().unwrap().title, "v2");
        assert_eq!(
            store.base(&record.id).unwrap().unwrap().memo().unwrap().title,
            "v1"
        );
    }

    #[tokio::test]
    async fn applied_delete_purges_local_record() {
        let store = memory_store();
        let queue = queue_with(store.clone(), EngineConfig::default());
        let remote = FakeRemote::new();

        let record = remote.server_put(Record::with_id(
            RecordId::new("real-5"),
            RecordBody::Memo(Memo::new("Gone", "soon")),
        ));
        store.save(&record, SyncStatus::Synced).unwrap();

        queue
            .enqueue(OperationKind::Delete, EntityKind::Memo, record.clone())
            .unwrap();
        assert!(store.get(&record.id).unwrap().unwrap().is_deleted);

        completed(queue.process_queue(&remote).await.unwrap());

        assert!(store.get(&record.id).unwrap().is_none());
        assert!(remote.server_record(&record.id).is_none());
    }

    #[tokio::test]
    async fn push_conflict_records_conflict_and_holds_record() {
        let store = memory_store();
        let queue = queue_with(store.clone(), EngineConfig::default());
        let remote = FakeRemote::new();
        let mut events = queue.events.subscribe();

        let server = remote.server_put(Record::with_id(
            RecordId::new("real-1"),
            RecordBody::Memo(Memo::new("Server", "x")),
        ));
        store.save(&server, SyncStatus::Synced).unwrap();
        remote.conflict_on_push(server.id.clone());

        let mut local = server.clone();
        local.body = RecordBody::Memo(Memo::new("Local", "x"));
        local.touch();
        queue
            .enqueue(OperationKind::Update, EntityKind::Memo, local.clone())
            .unwrap();
        queue
            .enqueue(OperationKind::Update, EntityKind::Memo, local.clone())
            .unwrap();

        let report = completed(queue.process_queue(&remote).await.unwrap());
        assert_eq!(report.conflicts, 1);
        assert_eq!(report.held, 1);
        assert_eq!(remote.push_count(), 1);

        let conflict = store.get_conflict(&local.id).unwrap().unwrap();
        assert_eq!(conflict.server_version, Some(server.clone()));
        assert_eq!(conflict.base_version.map(|base| base.id), Some(server.id));
        assert_eq!(
            store.get(&local.id).unwrap().unwrap().sync_status,
            SyncStatus::Conflict
        );
        assert!(drain(&mut events).contains(&SyncEvent::ConflictAdded { id: local.id }));

        // Still held on the next pass
        let report = completed(queue.process_queue(&remote).await.unwrap());
        assert_eq!(report.attempted, 0);
        assert_eq!(report.held, 1);
    }

    #[tokio::test]
    async fn transient_failure_backs_off() {
        let store = memory_store();
        let queue = queue_with(store.clone(), EngineConfig::default());
        let remote = FakeRemote::new();
        remote.fail_pushes(Some(RemoteError::Http {
            status: 503,
            message: "unavailable".into(),
        }));

        queue
            .enqueue(OperationKind::Create, EntityKind::Memo, memo("A"))
            .unwrap();
        let report = completed(queue.process_queue(&remote).await.unwrap());
        assert_eq!(report.retried, 1);
        let next = report.next_retry_at.unwrap();

        let op = &queue.pending()[0];
        assert_eq!(op.retry_count, 1);
        assert!(op.last_error.as_deref().unwrap().contains("503"));
        assert_eq!(op.next_attempt_at, next);
        assert!(next >= op.enqueued_at + 1_000);
        assert_eq!(store.operations().unwrap()[0].retry_count, 1);

        // Not due yet: the next pass does not touch the network
        let report = completed(queue.process_queue(&remote).await.unwrap());
        assert_eq!(report.attempted, 0);
        assert_eq!(report.held, 1);
        assert_eq!(remote.push_count(), 1);
    }

    #[tokio::test]
    async fn retry_budget_bounds_attempts() {
        let queue = queue_with(memory_store(), instant_retries());
        let remote = FakeRemote::new();
        let mut events = queue.events.subscribe();
        remote.fail_pushes(Some(RemoteError::Network("offline".into())));

        let op = queue
            .enqueue(OperationKind::Create, EntityKind::Memo, memo("A"))
            .unwrap();
        let report = completed(queue.flush(&remote, || true).await.unwrap());

        assert_eq!(remote.push_count(), 4);
        assert_eq!(report.attempted, 4);
        assert_eq!(report.retried, 3);
        assert_eq!(report.evicted, 1);
        assert_eq!(queue.pending_count(), 0);

        let failed = drain(&mut events)
            .into_iter()
            .filter_map(|event| match event {
                SyncEvent::OperationFailed {
                    operation_id,
                    failure,
                    ..
                } => Some((operation_id, failure)),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(
            failed,
            vec![(
                op.id,
                OperationFailure::RetryExhausted {
                    attempts: 4,
                    last_error: "Network error: offline".into(),
                }
            )]
        );
    }

    #[tokio::test]
    async fn client_error_evicts_immediately() {
        let queue = queue_with(memory_store(), EngineConfig::default());
        let remote = FakeRemote::new();
        let mut events = queue.events.subscribe();
        remote.fail_pushes(Some(RemoteError::Http {
            status: 422,
            message: "invalid".into(),
        }));

        queue
            .enqueue(OperationKind::Create, EntityKind::Memo, memo("A"))
            .unwrap();
        let report = completed(queue.flush(&remote, || true).await.unwrap());

        assert_eq!(report.evicted, 1);
        assert_eq!(remote.push_count(), 1);
        assert!(drain(&mut events).iter().any(|event| matches!(
            event,
            SyncEvent::OperationFailed {
                failure: OperationFailure::Rejected {
                    status: Some(422),
                    ..
                },
                ..
            }
        )));
    }

    fn failures(events: Vec<SyncEvent>) -> Vec<(OperationId, OperationFailure)> {
        events
            .into_iter()
            .filter_map(|event| match event {
                SyncEvent::OperationFailed {
                    operation_id,
                    failure,
                    ..
                } => Some((operation_id, failure)),
                _ => None,
            })
            .collect()
    }

    fn category_with_memo() -> (Record, Record) {
        let category = Record::with_id(
            RecordId::new("temp-1"),
            RecordBody::Category(Category::new("Work", "#336699")),
        );
        let filed = Record::with_id(
            RecordId::new("temp-2"),
            RecordBody::Memo(Memo::new("Filed", "x").with_category(category.id.clone())),
        );
        (category, filed)
    }

    #[tokio::test]
    async fn rejected_create_evicts_operations_that_point_at_it() {
        let store = memory_store();
        let queue = queue_with(store.clone(), EngineConfig::default());
        let remote = FakeRemote::new();
        let mut events = queue.events.subscribe();

        let (category, filed) = category_with_memo();
        queue
            .enqueue(OperationKind::Create, EntityKind::Category, category.clone())
            .unwrap();
        let memo_op = queue
            .enqueue(OperationKind::Create, EntityKind::Memo, filed.clone())
            .unwrap();
        remote.fail_pushes_for(
            category.id.clone(),
            RemoteError::Http {
                status: 422,
                message: "invalid".into(),
            },
        );

        let report = completed(queue.process_queue(&remote).await.unwrap());

        assert_eq!(report.attempted, 1);
        assert_eq!(report.evicted, 2);
        assert_eq!(queue.pending_count(), 0);
        assert_eq!(remote.push_count(), 1);
        assert!(remote
            .pushes()
            .iter()
            .all(|op| !op.payload.body.references(&category.id)));

        let events = drain(&mut events);
        let failed = failures(events.clone());
        assert_eq!(failed.len(), 2);
        assert!(matches!(
            failed[0].1,
            OperationFailure::Rejected {
                status: Some(422),
                ..
            }
        ));
        assert_eq!(
            failed[1],
            (
                memo_op.id,
                OperationFailure::DependencyFailed {
                    dependency: category.id.clone(),
                }
            )
        );

        // Both records are left for the user to keep or drop
        for id in [&category.id, &filed.id] {
            let conflict = store.get_conflict(id).unwrap().unwrap();
            assert_eq!(conflict.server_version, None);
            assert_eq!(
                store.get(id).unwrap().unwrap().sync_status,
                SyncStatus::Conflict
            );
            assert!(events.contains(&SyncEvent::ConflictAdded { id: id.clone() }));
        }

        // Later work filed under the missing category never goes out
        let later = Record::new(RecordBody::Memo(
            Memo::new("Later", "y").with_category(category.id.clone()),
        ));
        queue
            .enqueue(OperationKind::Create, EntityKind::Memo, later)
            .unwrap();
        let report = completed(queue.process_queue(&remote).await.unwrap());
        assert_eq!(report.attempted, 0);
        assert_eq!(report.held, 1);
        assert_eq!(remote.push_count(), 1);
    }

    #[tokio::test]
    async fn exhausted_create_evicts_operations_that_point_at_it() {
        let store = memory_store();
        let queue = queue_with(store.clone(), instant_retries());
        let remote = FakeRemote::new();
        let mut events = queue.events.subscribe();

        let (category, filed) = category_with_memo();
        queue
            .enqueue(OperationKind::Create, EntityKind::Category, category.clone())
            .unwrap();
        queue
            .enqueue(OperationKind::Create, EntityKind::Memo, filed.clone())
            .unwrap();
        remote.fail_pushes_for(category.id.clone(), RemoteError::Network("down".into()));

        let report = completed(queue.flush(&remote, || true).await.unwrap());

        assert_eq!(report.attempted, 4);
        assert_eq!(report.retried, 3);
        assert_eq!(report.evicted, 2);
        assert!(remote.pushes().iter().all(|op| op.record_id() == &category.id));
        assert!(failures(drain(&mut events)).iter().any(|(_, failure)| {
            *failure
                == OperationFailure::DependencyFailed {
                    dependency: category.id.clone(),
                }
        }));
        assert!(store.get_conflict(&filed.id).unwrap().is_some());
    }

    #[tokio::test]
    async fn process_queue_is_single_flight() {
        let queue = queue_with(memory_store(), EngineConfig::default());
        let remote = FakeRemote::new();
        queue
            .enqueue(OperationKind::Create, EntityKind::Memo, memo("A"))
            .unwrap();

        let (first, second) = tokio::join!(queue.process_queue(&remote), queue.process_queue(&remote));

        assert_eq!(completed(first.unwrap()).applied, 1);
        assert_eq!(second.unwrap(), QueueRun::Busy);
        assert_eq!(remote.push_count(), 1);

        // The flag is released afterwards
        assert!(matches!(
            queue.process_queue(&remote).await.unwrap(),
            QueueRun::Completed(_)
        ));
    }

    #[test]
    fn discard_for_drops_only_matching_operations() {
        let store = memory_store();
        let queue = queue_with(store.clone(), EngineConfig::default());
        let keep = memo("Keep");
        let drop = memo("Drop");
        queue
            .enqueue(OperationKind::Create, EntityKind::Memo, keep.clone())
            .unwrap();
        queue
            .enqueue(OperationKind::Create, EntityKind::Memo, drop.clone())
            .unwrap();
        queue
            .enqueue(OperationKind::Update, EntityKind::Memo, drop.clone())
            .unwrap();

        assert_eq!(queue.discard_for(&drop.id).unwrap(), 2);
        assert_eq!(queue.pending_count(), 1);
        assert!(queue.has_pending_for(&keep.id));
        assert_eq!(store.operations().unwrap().len(), 1);
        assert_eq!(queue.discard_for(&drop.id).unwrap(), 0);
    }

    #[test]
    fn subscribe_observes_queue_changes() {
        let queue = queue_with(memory_store(), EngineConfig::default());
        let rx = queue.subscribe();
        queue
            .enqueue(OperationKind::Create, EntityKind::Memo, memo("A"))
            .unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow().len(), 1);
    }
}
