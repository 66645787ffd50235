//! Per entity kind sync watermarks

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::models::EntityKind;

/// Last successful sync watermark per entity kind
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMetadata {
    watermarks: BTreeMap<EntityKind, i64>,
}

impl SyncMetadata {
    pub fn last_sync(&self, kind: EntityKind) -> Option<i64> {
        self.watermarks.get(&kind).copied()
    }

    pub fn set_last_sync(&mut self, kind: EntityKind, watermark: i64) {
        self.watermarks.insert(kind, watermark);
    }

    /// Cursor to pull from: the oldest watermark, or `None` if any kind
    /// has never completed a sync.
    pub fn pull_cursor(&self) -> Option<i64> {
        EntityKind::ALL
            .iter()
            .map(|kind| self.last_sync(*kind))
            .collect::<Option<Vec<_>>>()?
            .into_iter()
            .min()
    }

    /// Most recent watermark across kinds
    pub fn latest(&self) -> Option<i64> {
        self.watermarks.values().copied().max()
    }

    /// Whether `updated_at` is newer than the watermark of `kind`.
    ///
    /// Everything counts as changed before the first successful sync.
    pub fn changed_since(&self, kind: EntityKind, updated_at: i64) -> bool {
        self.last_sync(kind).is_none_or(|watermark| updated_at > watermark)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pull_cursor_requires_every_kind() {
        let mut metadata = SyncMetadata::default();
        assert_eq!(metadata.pull_cursor(), None);

        metadata.set_last_sync(EntityKind::Memo, 200);
        assert_eq!(metadata.pull_cursor(), None);

        metadata.set_last_sync(EntityKind::Category, 100);
        assert_eq!(metadata.pull_cursor(), Some(100));
        assert_eq!(metadata.latest(), Some(200));
    }

    #[test]
    fn changed_since_is_strict() {
        let mut metadata = SyncMetadata::default();
        assert!(metadata.changed_since(EntityKind::Memo, 0));

        metadata.set_last_sync(EntityKind::Memo, 100);
        assert!(!metadata.changed_since(EntityKind::Memo, 100));
        assert!(metadata.changed_since(EntityKind::Memo, 101));
    }
}
