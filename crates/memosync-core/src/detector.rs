//! Conflict detection over a pulled change set
//!
//! A record conflicts when both the server copy and the local copy changed
//! after the last successful sync of its entity kind. Detection is pure: the
//! caller gathers local snapshots and bases and applies the result.

use std::collections::{BTreeMap, BTreeSet};

use crate::models::{Conflict, Record, RecordId, SyncMetadata, SyncStatus};

/// What to do with a pulled change set
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Detection {
    /// Records changed on both sides, ordered by id
    pub conflicts: Vec<Conflict>,
    /// Server copies to store locally (only the server changed)
    pub apply: Vec<Record>,
    /// Ids deleted on the server and untouched locally
    pub remove: Vec<RecordId>,
}

/// Whether `local` carries changes the server has not seen.
///
/// Queued operations count regardless of timestamps: a held edit may be older
/// than the watermark and still undelivered. A record already in conflict
/// always counts, so a newer server copy refreshes the open conflict.
fn local_changed(local: &Record, queued: &BTreeSet<RecordId>) -> bool {
    queued.contains(&local.id) || local.sync_status != SyncStatus::Synced
}

/// Classify every pulled change against the local state.
///
/// `queued` holds the ids targeted by operations still in the queue.
pub fn detect(
    updated: &[Record],
    deleted_ids: &[RecordId],
    local: &BTreeMap<RecordId, Record>,
    bases: &BTreeMap<RecordId, Record>,
    queued: &BTreeSet<RecordId>,
    metadata: &SyncMetadata,
    detected_at: i64,
) -> Detection {
    let mut detection = Detection::default();
    let updated_ids = updated.iter().map(|record| &record.id).collect::<BTreeSet<_>>();

    for server in updated {
        let Some(local) = local.get(&server.id) else {
            detection.apply.push(server.clone());
            continue;
        };

        // A server copy equal to the base is an echo of what we already agreed on
        let server_changed = metadata.changed_since(server.entity_kind(), server.updated_at)
            && bases
                .get(&server.id)
                .is_none_or(|base| !base.same_content(server));
        if !server_changed {
            continue;
        }

        if !local_changed(local, queued) || local.same_content(server) {
            detection.apply.push(server.clone());
            continue;
        }

        detection.conflicts.push(Conflict::new(
            local.clone(),
            Some(server.clone()),
            bases.get(&server.id).cloned(),
            detected_at,
        ));
    }

    for id in deleted_ids {
        if updated_ids.contains(id) {
            continue;
        }
        let Some(local) = local.get(id) else {
            continue;
        };

        if local_changed(local, queued) && !local.is_deleted {
            detection.conflicts.push(Conflict::new(
                local.clone(),
                None,
                bases.get(id).cloned(),
                detected_at,
            ));
        } else {
            detection.remove.push(id.clone());
        }
    }

    detection.conflicts.sort_by(|a, b| a.id.cmp(&b.id));
    detection.apply.sort_by(|a, b| a.id.cmp(&b.id));
    detection.remove.sort();
    detection
}
