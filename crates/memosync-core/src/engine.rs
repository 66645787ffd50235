//! Sync orchestration
//!
//! `SyncEngine` owns the offline queue and drives a sync cycle:
//! pull, detect conflicts, auto-resolve, apply, push. Cycles are
//! single-flight and only run while the engine is online.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::{broadcast, watch};

use crate::config::EngineConfig;
use crate::db::{LocalStore, RecordIndex};
use crate::detector::{self, Detection};
use crate::error::{Error, Result};
use crate::events::{ConflictResolution, EventBus, SyncEvent};
use crate::models::{
    Category, Conflict, EntityKind, Memo, OperationKind, PendingOperation, Record, RecordBody,
    RecordId, ResolutionChoice, SyncStatus,
};
use crate::queue::{OfflineQueue, QueueReport, QueueRun};
use crate::remote::{PullResponse, RemoteError, RemoteStore};
use crate::resolver::{self, Resolution};
use crate::util::now_millis;

/// Where the engine is in a sync cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum SyncPhase {
    #[default]
    Idle,
    Pulling,
    Detecting,
    AutoResolving,
    Applying,
    Pushing,
    /// The last cycle stopped early; queued work is intact
    Failed { reason: String },
}

impl SyncPhase {
    /// Whether a cycle is in flight. `Failed` is a resting state.
    pub const fn is_running(&self) -> bool {
        !matches!(self, Self::Idle | Self::Failed { .. })
    }
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Pulling => f.write_str("pulling"),
            Self::Detecting => f.write_str("detecting"),
            Self::AutoResolving => f.write_str("auto-resolving"),
            Self::Applying => f.write_str("applying"),
            Self::Pushing => f.write_str("pushing"),
            Self::Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}

/// What one sync cycle did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// Server changes received (updates and deletions)
    pub pulled: usize,
    /// Server copies written locally
    pub applied: usize,
    /// Local records removed after server deletions
    pub removed: usize,
    pub conflicts_detected: usize,
    pub auto_resolved: usize,
    /// Conflicts left for the user
    pub unresolved: usize,
    pub queue: QueueReport,
    /// Watermark stored at the end of the cycle
    pub watermark: i64,
}

/// Result of a sync trigger
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// A cycle was already running; this trigger was coalesced into it
    Busy,
    /// The engine is offline; nothing was attempted
    Offline,
    Completed(CycleReport),
}

/// Snapshot for status displays
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    pub pending_count: usize,
    pub conflict_count: usize,
    /// Most recent watermark across entity kinds
    pub last_sync_at: Option<i64>,
    pub is_online: bool,
    pub phase: SyncPhase,
}

fn lock_phase(phase: &Mutex<SyncPhase>) -> MutexGuard<'_, SyncPhase> {
    phase.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Marks the cycle failed if its future is dropped before finishing
struct CycleGuard<'a> {
    phase: &'a Mutex<SyncPhase>,
    finished: bool,
}

impl<'a> CycleGuard<'a> {
    const fn new(phase: &'a Mutex<SyncPhase>) -> Self {
        Self {
            phase,
            finished: false,
        }
    }

    fn finish(mut self, phase: SyncPhase) {
        *lock_phase(self.phase) = phase;
        self.finished = true;
    }
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            *lock_phase(self.phase) = SyncPhase::Failed {
                reason: "sync cycle interrupted".to_string(),
            };
        }
    }
}

/// Offline-first sync engine over a local store and a remote
pub struct SyncEngine<S, R> {
    store: Arc<S>,
    remote: R,
    queue: OfflineQueue<S>,
    events: EventBus,
    phase: Mutex<SyncPhase>,
    online: AtomicBool,
}

impl<S: LocalStore, R: RemoteStore> SyncEngine<S, R> {
    /// Create an engine. It starts offline; call `set_online(true)` once
    /// connectivity is known.
    pub fn new(store: Arc<S>, remote: R, config: EngineConfig) -> Result<Self> {
        let events = EventBus::new(config.event_capacity);
        let queue = OfflineQueue::new(Arc::clone(&store), config, events.clone())?;

        Ok(Self {
            store,
            remote,
            queue,
            events,
            phase: Mutex::new(SyncPhase::Idle),
            online: AtomicBool::new(false),
        })
    }

    pub const fn remote(&self) -> &R {
        &self.remote
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    /// Record a connectivity change. Going online starts a sync cycle and
    /// returns its outcome.
    pub async fn set_online(&self, online: bool) -> Result<Option<CycleOutcome>> {
        let was_online = self.online.swap(online, Ordering::AcqRel);
        match (was_online, online) {
            (false, true) => {
                tracing::info!("Connectivity restored");
                self.sync().await.map(Some)
            }
            (true, false) => {
                tracing::info!("Connectivity lost");
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    pub fn phase(&self) -> SyncPhase {
        lock_phase(&self.phase).clone()
    }

    fn set_phase(&self, phase: SyncPhase) {
        tracing::debug!("Sync phase: {phase}");
        *lock_phase(&self.phase) = phase;
    }

    /// Run one sync cycle now
    pub async fn sync(&self) -> Result<CycleOutcome> {
        if !self.is_online() {
            tracing::debug!("Skipping sync while offline");
            return Ok(CycleOutcome::Offline);
        }

        {
            let mut phase = lock_phase(&self.phase);
            if phase.is_running() {
                tracing::debug!("Sync already in progress ({phase})");
                return Ok(CycleOutcome::Busy);
            }
            *phase = SyncPhase::Pulling;
        }
        let guard = CycleGuard::new(&self.phase);
        self.events.emit(SyncEvent::CycleStarted);

        match self.run_cycle().await {
            Ok(report) => {
                guard.finish(SyncPhase::Idle);
                tracing::info!(
                    "Sync complete: pulled {}, applied {}, removed {}, {} conflicts ({} auto-resolved), pushed {}",
                    report.pulled,
                    report.applied,
                    report.removed,
                    report.conflicts_detected,
                    report.auto_resolved,
                    report.queue.applied
                );
                self.events.emit(SyncEvent::CycleCompleted {
                    report: report.clone(),
                });
                Ok(CycleOutcome::Completed(report))
            }
            Err(error) => {
                let reason = error.to_string();
                guard.finish(SyncPhase::Failed {
                    reason: reason.clone(),
                });
                tracing::warn!("Sync failed: {reason}");
                self.events.emit(SyncEvent::CycleFailed { reason });
                Err(error)
            }
        }
    }

    async fn run_cycle(&self) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        let metadata = self.store.sync_metadata()?;
        let pull = self.remote.pull(metadata.pull_cursor()).await?;
        report.pulled = pull.updated.len() + pull.deleted_ids.len();

        self.set_phase(SyncPhase::Detecting);
        let (local, bases) = self.snapshots(&pull)?;
        let queued = self
            .queue
            .pending()
            .iter()
            .map(|operation| operation.record_id().clone())
            .collect::<BTreeSet<_>>();
        let Detection {
            conflicts,
            apply,
            remove,
        } = detector::detect(
            &pull.updated,
            &pull.deleted_ids,
            &local,
            &bases,
            &queued,
            &metadata,
            now_millis(),
        );
        report.conflicts_detected = conflicts.len();

        self.set_phase(SyncPhase::AutoResolving);
        let (resolved, unresolved): (Vec<_>, Vec<_>) = conflicts
            .into_iter()
            .map(|conflict| {
                let resolution = resolver::resolve(&conflict);
                (conflict, resolution)
            })
            .partition(|(_, resolution)| resolution.can_auto_resolve);

        self.set_phase(SyncPhase::Applying);
        for record in &apply {
            self.apply_server_copy(record)?;
            report.applied += 1;
        }
        for id in &remove {
            self.queue.discard_for(id)?;
            self.store.remove_conflict(id)?;
            self.store.delete(id)?;
            report.removed += 1;
        }
        for (conflict, resolution) in resolved {
            self.apply_auto_merge(&conflict, resolution)?;
            report.auto_resolved += 1;
        }
        for (conflict, _) in unresolved {
            // An open conflict only picks up the newer server copy
            let refreshed = self.store.get_conflict(&conflict.id)?.is_some();
            self.store.save_conflict(&conflict)?;
            self.store.save(&conflict.local_version, SyncStatus::Conflict)?;
            if refreshed {
                tracing::debug!("Refreshed open conflict on {}", conflict.id);
                continue;
            }
            tracing::warn!("Conflict on {} {} needs a decision", conflict.entity_kind, conflict.id);
            self.events.emit(SyncEvent::ConflictAdded { id: conflict.id });
            report.unresolved += 1;
        }

        self.set_phase(SyncPhase::Pushing);
        report.queue = match self.queue.flush(&self.remote, || self.is_online()).await? {
            QueueRun::Completed(queue_report) => queue_report,
            QueueRun::Busy => QueueReport::default(),
        };
        if !self.is_online() {
            return Err(RemoteError::Network("connectivity lost during sync".into()).into());
        }

        for kind in EntityKind::ALL {
            self.store.set_last_sync(kind, pull.watermark)?;
        }
        report.watermark = pull.watermark;
        Ok(report)
    }

    /// Local copies and bases of every record the pull touched
    #[allow(clippy::type_complexity)]
    fn snapshots(
        &self,
        pull: &PullResponse,
    ) -> Result<(BTreeMap<RecordId, Record>, BTreeMap<RecordId, Record>)> {
        let mut local = BTreeMap::new();
        let mut bases = BTreeMap::new();
        let ids = pull
            .updated
            .iter()
            .map(|record| &record.id)
            .chain(pull.deleted_ids.iter());

        for id in ids {
            if let Some(record) = self.store.get(id)? {
                local.insert(id.clone(), record);
            }
            if let Some(base) = self.store.base(id)? {
                bases.insert(id.clone(), base);
            }
        }
        Ok((local, bases))
    }

    fn apply_server_copy(&self, record: &Record) -> Result<()> {
        if self.store.remove_conflict(&record.id)? {
            tracing::debug!("Conflict on {} settled by identical server copy", record.id);
        }
        if self.queue.has_pending_for(&record.id) {
            self.store.save_base(record)
        } else {
            self.store.save(record, SyncStatus::Synced).map(|_| ())
        }
    }

    fn apply_auto_merge(&self, conflict: &Conflict, resolution: Resolution) -> Result<()> {
        let Some(merged) = resolution.merged else {
            return Ok(());
        };

        self.store.remove_conflict(&conflict.id)?;
        if let Some(server) = &conflict.server_version {
            self.store.save_base(server)?;
        }
        self.queue.discard_for(&conflict.id)?;
        self.queue
            .enqueue(OperationKind::Update, merged.entity_kind(), merged)?;

        tracing::info!(
            "Auto-resolved conflict on {} ({})",
            conflict.id,
            resolution.strategy
        );
        self.events.emit(SyncEvent::ConflictResolved {
            id: conflict.id.clone(),
            resolution: ConflictResolution::Auto(resolution.strategy),
        });
        Ok(())
    }

    /// Queue a raw mutation
    pub fn enqueue(
        &self,
        kind: OperationKind,
        entity_kind: EntityKind,
        payload: Record,
    ) -> Result<PendingOperation> {
        self.queue.enqueue(kind, entity_kind, payload)
    }

    pub fn create_memo(&self, memo: Memo) -> Result<Record> {
        self.create(RecordBody::Memo(memo))
    }

    pub fn create_category(&self, category: Category) -> Result<Record> {
        self.create(RecordBody::Category(category))
    }

    pub fn update_memo(&self, id: &RecordId, memo: Memo) -> Result<Record> {
        self.update(id, RecordBody::Memo(memo))
    }

    pub fn update_category(&self, id: &RecordId, category: Category) -> Result<Record> {
        self.update(id, RecordBody::Category(category))
    }

    fn create(&self, body: RecordBody) -> Result<Record> {
        let record = Record::new(body);
        let operation =
            self.queue
                .enqueue(OperationKind::Create, record.entity_kind(), record)?;
        Ok(operation.payload)
    }

    fn update(&self, id: &RecordId, body: RecordBody) -> Result<Record> {
        let mut record = self.live_record(id)?;
        if record.entity_kind() != body.entity_kind() {
            return Err(Error::InvalidInput(format!(
                "{id} is a {}, not a {}",
                record.entity_kind(),
                body.entity_kind()
            )));
        }

        record.body = body;
        record.touch();
        let operation = self
            .queue
            .enqueue(OperationKind::Update, record.entity_kind(), record)?;
        Ok(operation.payload)
    }

    /// Soft-delete a record; it disappears locally once the server confirms
    pub fn delete(&self, id: &RecordId) -> Result<()> {
        let mut record = self.live_record(id)?;
        record.touch();
        self.queue
            .enqueue(OperationKind::Delete, record.entity_kind(), record)?;
        Ok(())
    }

    fn live_record(&self, id: &RecordId) -> Result<Record> {
        self.store
            .get(id)?
            .filter(|record| !record.is_deleted)
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    /// Get a record by id, tombstones included
    pub fn get(&self, id: &RecordId) -> Result<Option<Record>> {
        self.store.get(id)
    }

    /// Live records of one kind, newest first
    pub fn list(&self, kind: EntityKind) -> Result<Vec<Record>> {
        Ok(self
            .store
            .get_by_index(&RecordIndex::EntityKind(kind))?
            .into_iter()
            .filter(|record| !record.is_deleted)
            .collect())
    }

    /// Live memos filed under a category
    pub fn list_in_category(&self, category_id: &RecordId) -> Result<Vec<Record>> {
        Ok(self
            .store
            .get_by_index(&RecordIndex::Category(category_id.clone()))?
            .into_iter()
            .filter(|record| !record.is_deleted)
            .collect())
    }

    pub fn pending_count(&self) -> usize {
        self.queue.pending_count()
    }

    pub fn pending(&self) -> Vec<PendingOperation> {
        self.queue.pending()
    }

    pub fn conflicts(&self) -> Result<Vec<Conflict>> {
        self.store.conflicts()
    }

    /// Preview how the resolver would settle an open conflict
    pub fn resolution(&self, id: &RecordId) -> Result<Resolution> {
        let conflict = self.open_conflict(id)?;
        Ok(resolver::resolve(&conflict))
    }

    fn open_conflict(&self, id: &RecordId) -> Result<Conflict> {
        self.store
            .get_conflict(id)?
            .ok_or_else(|| Error::NotFound(format!("no open conflict for {id}")))
    }

    /// Settle an open conflict with an explicit choice.
    ///
    /// Returns the resulting local record, or `None` when the choice deletes it.
    /// Pushing the outcome is left to the next sync.
    pub fn resolve_conflict(
        &self,
        id: &RecordId,
        choice: ResolutionChoice,
    ) -> Result<Option<Record>> {
        let conflict = self.open_conflict(id)?;

        let outcome = match choice {
            ResolutionChoice::Server => {
                self.settle(&conflict)?;
                match &conflict.server_version {
                    Some(server) => Some(self.store.save(server, SyncStatus::Synced)?),
                    None => {
                        self.store.delete(id)?;
                        if id.is_temporary() {
                            // Never reached the server; nothing can point at it there
                            self.queue.evict_dependents(id)?;
                        }
                        None
                    }
                }
            }
            ResolutionChoice::Local => {
                let mut local = conflict.local_version.clone();
                local.touch();
                self.detach_missing_reference(&mut local)?;
                let kind = if local.is_deleted {
                    OperationKind::Delete
                } else if conflict.server_version.is_none() {
                    OperationKind::Create
                } else {
                    OperationKind::Update
                };
                if let Some(server) = &conflict.server_version {
                    local.sync_version = local.sync_version.max(server.sync_version + 1);
                }

                self.settle(&conflict)?;
                let operation = self.queue.enqueue(kind, local.entity_kind(), local)?;
                Some(operation.payload)
            }
            ResolutionChoice::MergeSuggestion => {
                let merged = resolver::resolve(&conflict).merged.ok_or_else(|| {
                    Error::InvalidInput(format!(
                        "conflict on {id} has no merge suggestion; keep local or server instead"
                    ))
                })?;

                self.settle(&conflict)?;
                let operation =
                    self.queue
                        .enqueue(OperationKind::Update, merged.entity_kind(), merged)?;
                Some(operation.payload)
            }
        };

        tracing::info!("Resolved conflict on {id} with {}", choice.as_str());
        self.events.emit(SyncEvent::ConflictResolved {
            id: id.clone(),
            resolution: ConflictResolution::User(choice),
        });
        Ok(outcome)
    }

    /// Close a conflict: drop it, its queued operations, and record the
    /// server copy as the new base
    fn settle(&self, conflict: &Conflict) -> Result<()> {
        self.store.remove_conflict(&conflict.id)?;
        self.queue.discard_for(&conflict.id)?;
        if let Some(server) = &conflict.server_version {
            self.store.save_base(server)?;
        }
        Ok(())
    }

    /// Clear a foreign key to a temporary record that was dropped locally
    fn detach_missing_reference(&self, record: &mut Record) -> Result<()> {
        let Some(target) = record
            .body
            .foreign_key()
            .filter(|id| id.is_temporary())
            .cloned()
        else {
            return Ok(());
        };
        if self.store.get(&target)?.is_some() {
            return Ok(());
        }

        if let RecordBody::Memo(memo) = &mut record.body {
            memo.category_id = None;
        }
        tracing::info!("Detached {} from dropped {target}", record.id);
        Ok(())
    }

    pub fn status(&self) -> Result<SyncSummary> {
        Ok(SyncSummary {
            pending_count: self.queue.pending_count(),
            conflict_count: self.store.conflicts()?.len(),
            last_sync_at: self.store.sync_metadata()?.latest(),
            is_online: self.is_online(),
            phase: self.phase(),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Live view of the operation log
    pub fn subscribe_queue(&self) -> watch::Receiver<Vec<PendingOperation>> {
        self.queue.subscribe()
    }
}
