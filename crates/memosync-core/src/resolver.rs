//! Conflict resolution
//!
//! Rules are tried from safest to most permissive:
//!
//! 1. disjoint changed fields are merged field by field (`merge`)
//! 2. when only tags overlap the tag sets are unioned (`merge-tags`)
//! 3. a category with one differing field takes the later version (`use-latest`)
//! 4. with a base snapshot, a three-way merge preferring local values (`three-way`)
//!
//! Anything else is left to the user together with a suggested merge.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::models::{
    Conflict, ConflictKind, EntityKind, Field, MergeStrategy, Record, RecordId, SyncStatus,
};
use crate::util::now_millis;

/// Outcome of running the resolver on one conflict
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub id: RecordId,
    pub can_auto_resolve: bool,
    pub strategy: MergeStrategy,
    /// The merged record, or the suggested merge when manual.
    /// `None` for delete-update conflicts.
    pub merged: Option<Record>,
}

impl Resolution {
    fn auto(strategy: MergeStrategy, merged: Record) -> Self {
        Self {
            id: merged.id.clone(),
            can_auto_resolve: true,
            strategy,
            merged: Some(merged),
        }
    }

    fn manual(id: RecordId, suggestion: Option<Record>) -> Self {
        Self {
            id,
            can_auto_resolve: false,
            strategy: MergeStrategy::Manual,
            merged: suggestion,
        }
    }
}

/// Resolve a conflict, stamping three-way merges with the current time
pub fn resolve(conflict: &Conflict) -> Resolution {
    resolve_at(conflict, now_millis())
}

/// Resolve a conflict as of `now`
pub fn resolve_at(conflict: &Conflict, now: i64) -> Resolution {
    let local = &conflict.local_version;
    let server = match (&conflict.server_version, conflict.kind) {
        (Some(server), ConflictKind::Update) => server,
        _ => return Resolution::manual(conflict.id.clone(), None),
    };
    let latest = server.updated_at.max(local.updated_at);

    let (server_changed, local_changed) = match &conflict.base_version {
        Some(base) => (base.changed_fields(server), base.changed_fields(local)),
        None => {
            let differing = server.changed_fields(local);
            (differing.clone(), differing)
        }
    };
    let overlap = server_changed
        .intersection(&local_changed)
        .copied()
        .collect::<BTreeSet<_>>();

    if overlap.is_empty() {
        let merged = overlay(server, local, &local_changed);
        return Resolution::auto(MergeStrategy::Merge, finish(merged, server, local, latest));
    }

    if overlap.len() == 1 && overlap.contains(&Field::Tags) {
        let mut merged = overlay(server, local, &local_changed);
        merged.body.union_tags(&server.body);
        return Resolution::auto(MergeStrategy::MergeTags, finish(merged, server, local, latest));
    }

    if local.entity_kind() == EntityKind::Category {
        if server.changed_fields(local).len() <= 1 {
            let winner = if server.updated_at > local.updated_at {
                server
            } else {
                local
            };
            return Resolution::auto(
                MergeStrategy::UseLatest,
                finish(winner.clone(), server, local, latest),
            );
        }
        return Resolution::manual(conflict.id.clone(), Some(suggestion(conflict, server, now)));
    }

    if let Some(base) = &conflict.base_version {
        let merged = merge_from_base(base, server, local, now);
        return Resolution::auto(MergeStrategy::ThreeWay, merged);
    }

    Resolution::manual(conflict.id.clone(), Some(suggestion(conflict, server, now)))
}

/// Base-aware merge: one-sided changes are applied, overlapping tag edits are
/// unioned and other overlapping fields keep the local value.
pub fn three_way_merge(
    base: Option<&Record>,
    server: &Record,
    local: &Record,
    now: i64,
) -> Result<Record> {
    let base = base.ok_or_else(|| Error::MissingBase(local.id.to_string()))?;
    Ok(merge_from_base(base, server, local, now))
}

fn merge_from_base(base: &Record, server: &Record, local: &Record, now: i64) -> Record {
    let server_changed = base.changed_fields(server);
    let local_changed = base.changed_fields(local);

    let mut merged = base.clone();
    for field in server_changed.difference(&local_changed) {
        merged.body.copy_field(&server.body, *field);
    }
    for field in &local_changed {
        merged.body.copy_field(&local.body, *field);
        if *field == Field::Tags && server_changed.contains(field) {
            merged.body.union_tags(&server.body);
        }
    }

    let stamp = now.max(server.updated_at).max(local.updated_at);
    finish(merged, server, local, stamp)
}

/// Manual fallback: three-way when a base is known, else local with tags unioned
fn suggestion(conflict: &Conflict, server: &Record, now: i64) -> Record {
    let local = &conflict.local_version;
    if let Some(base) = &conflict.base_version {
        return merge_from_base(base, server, local, now);
    }
    let mut merged = local.clone();
    merged.body.union_tags(&server.body);
    finish(merged, server, local, server.updated_at.max(local.updated_at))
}

/// Start from `server` and take every field in `fields` from `local`
fn overlay(server: &Record, local: &Record, fields: &BTreeSet<Field>) -> Record {
    let mut merged = server.clone();
    for field in fields {
        merged.body.copy_field(&local.body, *field);
    }
    merged
}

/// Bookkeeping of a merge result: it is a new local write of the local record
fn finish(mut merged: Record, server: &Record, local: &Record, updated_at: i64) -> Record {
    merged.id = local.id.clone();
    merged.created_at = local.created_at;
    merged.updated_at = updated_at;
    merged.last_sync_at = local.last_sync_at;
    merged.is_deleted = false;
    merged.sync_status = SyncStatus::Pending;
    merged.sync_version = server.sync_version.max(local.sync_version) + 1;
    merged
}
