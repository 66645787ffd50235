//! Durable local store implementation

use std::sync::{Mutex, MutexGuard};

use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Params};
use serde::de::DeserializeOwned;

use crate::db::Database;
use crate::error::{Error, Result};
use crate::models::{
    Conflict, EntityKind, OperationId, PendingOperation, Record, RecordId, SyncMetadata,
    SyncStatus,
};
use crate::util::now_millis;

/// Secondary lookups supported by the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordIndex {
    /// Memos belonging to a category
    Category(RecordId),
    SyncStatus(SyncStatus),
    EntityKind(EntityKind),
    /// Records with `updated_at` strictly greater than the timestamp
    UpdatedSince(i64),
}

/// Trait for the engine's durable storage.
///
/// Every write is atomic per record; there are no cross-record transactions
/// except where a method documents otherwise.
pub trait LocalStore {
    /// Write a record with the given status and return what was stored.
    ///
    /// A `Pending` write to a record with an open conflict is stored as
    /// `Conflict`. A `Synced` write also replaces the record's base snapshot.
    fn save(&self, record: &Record, status: SyncStatus) -> Result<Record>;

    /// Get a record by ID (tombstones included)
    fn get(&self, id: &RecordId) -> Result<Option<Record>>;

    /// All records, newest first
    fn get_all(&self) -> Result<Vec<Record>>;

    /// Records matching a secondary index, newest first
    fn get_by_index(&self, index: &RecordIndex) -> Result<Vec<Record>>;

    /// Remove a record and its base snapshot
    fn delete(&self, id: &RecordId) -> Result<bool>;

    /// Pending records of one kind, oldest change first
    fn pending_records(&self, kind: EntityKind) -> Result<Vec<Record>>;

    /// Remove every record, operation, conflict and watermark
    fn clear(&self) -> Result<()>;

    /// Last snapshot both sides agreed on
    fn base(&self, id: &RecordId) -> Result<Option<Record>>;

    /// Replace the base snapshot without touching the record itself
    fn save_base(&self, record: &Record) -> Result<()>;

    /// Rename a record (and its base) and rewrite foreign keys pointing at it,
    /// in one transaction.
    fn remap_record_id(&self, from: &RecordId, to: &RecordId) -> Result<()>;

    /// Append an operation to the log
    fn append_operation(&self, operation: &PendingOperation) -> Result<()>;

    /// The operation log in enqueue order
    fn operations(&self) -> Result<Vec<PendingOperation>>;

    /// Persist retry bookkeeping or a rewritten payload
    fn update_operation(&self, operation: &PendingOperation) -> Result<()>;

    fn remove_operation(&self, id: &OperationId) -> Result<bool>;

    fn save_conflict(&self, conflict: &Conflict) -> Result<()>;

    /// Open conflicts, oldest first
    fn conflicts(&self) -> Result<Vec<Conflict>>;

    fn get_conflict(&self, id: &RecordId) -> Result<Option<Conflict>>;

    fn remove_conflict(&self, id: &RecordId) -> Result<bool>;

    fn sync_metadata(&self) -> Result<SyncMetadata>;

    /// Watermark of the last successful sync of `kind`
    fn last_sync(&self, kind: EntityKind) -> Result<Option<i64>> {
        Ok(self.sync_metadata()?.last_sync(kind))
    }

    fn set_last_sync(&self, kind: EntityKind, watermark: i64) -> Result<()>;
}

/// `SQLite` implementation of `LocalStore`
pub struct SqliteStore {
    db: Mutex<Database>,
}

impl SqliteStore {
    /// Create a store over an open database
    pub const fn new(db: Database) -> Self {
        Self { db: Mutex::new(db) }
    }

    /// Open a file-backed store
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        Ok(Self::new(Database::open(path)?))
    }

    /// Open an in-memory store (useful for testing)
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::new(Database::open_in_memory()?))
    }

    fn db(&self) -> Result<MutexGuard<'_, Database>> {
        self.db
            .lock()
            .map_err(|_| Error::Database("local store lock poisoned".into()))
    }

    fn query_records<P: Params>(conn: &Connection, sql: &str, params: P) -> Result<Vec<Record>> {
        let mut stmt = conn.prepare(sql)?;
        let records = stmt
            .query_map(params, |row| parse_payload(&row.get::<_, String>(0)?))?
            .collect::<rusqlite::Result<Vec<Record>>>()?;
        Ok(records)
    }

    fn read_record(conn: &Connection, table: &str, id: &RecordId) -> Result<Option<Record>> {
        let sql = format!("SELECT payload FROM {table} WHERE id = ?1");
        let payload: Option<String> = conn
            .query_row(&sql, params![id.as_str()], |row| row.get(0))
            .optional()?;
        payload
            .map(|payload| serde_json::from_str(&payload).map_err(Error::from))
            .transpose()
    }

    fn write_record(conn: &Connection, record: &Record) -> Result<()> {
        let category_id = record
            .memo()
            .and_then(|memo| memo.category_id.as_ref())
            .map(RecordId::as_str);
        conn.execute(
            "INSERT OR REPLACE INTO records
                (id, entity_kind, category_id, sync_status, updated_at, is_deleted, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.id.as_str(),
                record.entity_kind().as_str(),
                category_id,
                record.sync_status.as_str(),
                record.updated_at,
                i32::from(record.is_deleted),
                serde_json::to_string(record)?,
            ],
        )?;
        Ok(())
    }

    fn write_base(conn: &Connection, record: &Record) -> Result<()> {
        conn.execute(
            "INSERT OR REPLACE INTO record_bases (id, payload) VALUES (?1, ?2)",
            params![record.id.as_str(), serde_json::to_string(record)?],
        )?;
        Ok(())
    }
}

/// Decode a JSON payload column inside a row mapper
fn parse_payload<T: DeserializeOwned>(payload: &str) -> rusqlite::Result<T> {
    serde_json::from_str(payload)
        .map_err(|error| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(error)))
}

impl LocalStore for SqliteStore {
    fn save(&self, record: &Record, status: SyncStatus) -> Result<Record> {
        let db = self.db()?;
        let tx = db.connection().unchecked_transaction()?;

        let in_conflict: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM conflicts WHERE id = ?1)",
            params![record.id.as_str()],
            |row| row.get(0),
        )?;

        let mut stored = record.clone();
        stored.sync_status = if in_conflict && status == SyncStatus::Pending {
            SyncStatus::Conflict
        } else {
            status
        };
        if stored.sync_status == SyncStatus::Synced {
            stored.last_sync_at = Some(now_millis());
        }

        Self::write_record(&tx, &stored)?;
        if stored.sync_status == SyncStatus::Synced {
            Self::write_base(&tx, &stored)?;
        }
        tx.commit()?;

        Ok(stored)
    }

    fn get(&self, id: &RecordId) -> Result<Option<Record>> {
        let db = self.db()?;
        Self::read_record(db.connection(), "records", id)
    }

    fn get_all(&self) -> Result<Vec<Record>> {
        let db = self.db()?;
        Self::query_records(
            db.connection(),
            "SELECT payload FROM records ORDER BY updated_at DESC",
            [],
        )
    }

    fn get_by_index(&self, index: &RecordIndex) -> Result<Vec<Record>> {
        let db = self.db()?;
        let conn = db.connection();
        match index {
            RecordIndex::Category(category_id) => Self::query_records(
                conn,
                "SELECT payload FROM records WHERE category_id = ?1 ORDER BY updated_at DESC",
                params![category_id.as_str()],
            ),
            RecordIndex::SyncStatus(status) => Self::query_records(
                conn,
                "SELECT payload FROM records WHERE sync_status = ?1 ORDER BY updated_at DESC",
                params![status.as_str()],
            ),
            RecordIndex::EntityKind(kind) => Self::query_records(
                conn,
                "SELECT payload FROM records WHERE entity_kind = ?1 ORDER BY updated_at DESC",
                params![kind.as_str()],
            ),
            RecordIndex::UpdatedSince(timestamp) => Self::query_records(
                conn,
                "SELECT payload FROM records WHERE updated_at > ?1 ORDER BY updated_at DESC",
                params![timestamp],
            ),
        }
    }

    fn delete(&self, id: &RecordId) -> Result<bool> {
        let db = self.db()?;
        let tx = db.connection().unchecked_transaction()?;
        let rows = tx.execute("DELETE FROM records WHERE id = ?1", params![id.as_str()])?;
        tx.execute(
            "DELETE FROM record_bases WHERE id = ?1",
            params![id.as_str()],
        )?;
        tx.commit()?;
        Ok(rows > 0)
    }

    fn pending_records(&self, kind: EntityKind) -> Result<Vec<Record>> {
        let db = self.db()?;
        Self::query_records(
            db.connection(),
            "SELECT payload FROM records
             WHERE entity_kind = ?1 AND sync_status = 'pending'
             ORDER BY updated_at ASC",
            params![kind.as_str()],
        )
    }

    fn clear(&self) -> Result<()> {
        let db = self.db()?;
        db.connection().execute_batch(
            "BEGIN;
             DELETE FROM records;
             DELETE FROM record_bases;
             DELETE FROM pending_operations;
             DELETE FROM conflicts;
             DELETE FROM sync_metadata;
             COMMIT;",
        )?;
        tracing::info!("Cleared local store");
        Ok(())
    }

    fn base(&self, id: &RecordId) -> Result<Option<Record>> {
        let db = self.db()?;
        Self::read_record(db.connection(), "record_bases", id)
    }

    fn save_base(&self, record: &Record) -> Result<()> {
        let db = self.db()?;
        Self::write_base(db.connection(), record)
    }

    fn remap_record_id(&self, from: &RecordId, to: &RecordId) -> Result<()> {
        let db = self.db()?;
        let tx = db.connection().unchecked_transaction()?;

        if let Some(mut record) = Self::read_record(&tx, "records", from)? {
            record.id = to.clone();
            tx.execute("DELETE FROM records WHERE id = ?1", params![from.as_str()])?;
            Self::write_record(&tx, &record)?;
        }
        if let Some(mut base) = Self::read_record(&tx, "record_bases", from)? {
            base.id = to.clone();
            tx.execute(
                "DELETE FROM record_bases WHERE id = ?1",
                params![from.as_str()],
            )?;
            Self::write_base(&tx, &base)?;
        }

        let dependents = Self::query_records(
            &tx,
            "SELECT payload FROM records WHERE category_id = ?1",
            params![from.as_str()],
        )?;
        for mut dependent in dependents {
            dependent.body.remap_reference(from, to);
            Self::write_record(&tx, &dependent)?;
        }

        tx.commit()?;
        Ok(())
    }

    fn append_operation(&self, operation: &PendingOperation) -> Result<()> {
        let db = self.db()?;
        db.connection().execute(
            "INSERT INTO pending_operations
                (id, record_id, entity_kind, kind, enqueued_at, retry_count,
                 next_attempt_at, last_error, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                operation.id.as_str(),
                operation.record_id().as_str(),
                operation.entity_kind.as_str(),
                operation.kind.as_str(),
                operation.enqueued_at,
                operation.retry_count,
                operation.next_attempt_at,
                operation.last_error,
                serde_json::to_string(operation)?,
            ],
        )?;
        Ok(())
    }

    fn operations(&self) -> Result<Vec<PendingOperation>> {
        let db = self.db()?;
        let mut stmt = db
            .connection()
            .prepare("SELECT payload FROM pending_operations ORDER BY enqueued_at, seq")?;
        let operations = stmt
            .query_map([], |row| parse_payload(&row.get::<_, String>(0)?))?
            .collect::<rusqlite::Result<Vec<PendingOperation>>>()?;
        Ok(operations)
    }

    fn update_operation(&self, operation: &PendingOperation) -> Result<()> {
        let db = self.db()?;
        let rows = db.connection().execute(
            "UPDATE pending_operations
             SET record_id = ?2, retry_count = ?3, next_attempt_at = ?4,
                 last_error = ?5, payload = ?6
             WHERE id = ?1",
            params![
                operation.id.as_str(),
                operation.record_id().as_str(),
                operation.retry_count,
                operation.next_attempt_at,
                operation.last_error,
                serde_json::to_string(operation)?,
            ],
        )?;

        if rows == 0 {
            return Err(Error::NotFound(operation.id.to_string()));
        }
        Ok(())
    }

    fn remove_operation(&self, id: &OperationId) -> Result<bool> {
        let db = self.db()?;
        let rows = db.connection().execute(
            "DELETE FROM pending_operations WHERE id = ?1",
            params![id.as_str()],
        )?;
        Ok(rows > 0)
    }

    fn save_conflict(&self, conflict: &Conflict) -> Result<()> {
        let db = self.db()?;
        db.connection().execute(
            "INSERT OR REPLACE INTO conflicts (id, entity_kind, kind, detected_at, payload)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                conflict.id.as_str(),
                conflict.entity_kind.as_str(),
                conflict.kind.as_str(),
                conflict.detected_at,
                serde_json::to_string(conflict)?,
            ],
        )?;
        Ok(())
    }

    fn conflicts(&self) -> Result<Vec<Conflict>> {
        let db = self.db()?;
        let mut stmt = db
            .connection()
            .prepare("SELECT payload FROM conflicts ORDER BY detected_at, id")?;
        let conflicts = stmt
            .query_map([], |row| parse_payload(&row.get::<_, String>(0)?))?
            .collect::<rusqlite::Result<Vec<Conflict>>>()?;
        Ok(conflicts)
    }

    fn get_conflict(&self, id: &RecordId) -> Result<Option<Conflict>> {
        let db = self.db()?;
        let payload: Option<String> = db
            .connection()
            .query_row(
                "SELECT payload FROM conflicts WHERE id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        payload
            .map(|payload| serde_json::from_str(&payload).map_err(Error::from))
            .transpose()
    }

    fn remove_conflict(&self, id: &RecordId) -> Result<bool> {
        let db = self.db()?;
        let rows = db
            .connection()
            .execute("DELETE FROM conflicts WHERE id = ?1", params![id.as_str()])?;
        Ok(rows > 0)
    }

    fn sync_metadata(&self) -> Result<SyncMetadata> {
        let db = self.db()?;
        let mut stmt = db
            .connection()
            .prepare("SELECT entity_kind, last_sync_at FROM sync_metadata")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut metadata = SyncMetadata::default();
        for (kind, watermark) in rows {
            metadata.set_last_sync(kind.parse()?, watermark);
        }
        Ok(metadata)
    }

    fn set_last_sync(&self, kind: EntityKind, watermark: i64) -> Result<()> {
        let db = self.db()?;
        db.connection().execute(
            "INSERT INTO sync_metadata (entity_kind, last_sync_at) VALUES (?1, ?2)
             ON CONFLICT(entity_kind) DO UPDATE SET last_sync_at = excluded.last_sync_at",
            params![kind.as_str(), watermark],
        )?;
        Ok(())
    }
}
