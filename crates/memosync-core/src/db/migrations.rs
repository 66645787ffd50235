//! Database migrations

use crate::error::Result;
use rusqlite::Connection;

/// Current schema version
const CURRENT_VERSION: i32 = 3;

/// Run all pending migrations
pub fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn)?;

    if version < 1 {
        apply(conn, 1, MIGRATION_V1)?;
    }
    if version < 2 {
        apply(conn, 2, MIGRATION_V2)?;
    }
    if version < 3 {
        apply(conn, 3, MIGRATION_V3)?;
    }

    Ok(())
}

/// Get the current schema version
fn get_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get(0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;
    Ok(version)
}

/// Apply one migration atomically
fn apply(conn: &Connection, version: i32, statements: &str) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(statements)?;
    tx.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        [version],
    )?;
    tx.commit()?;

    tracing::info!("Migrated local store to version {version}/{CURRENT_VERSION}");
    Ok(())
}

/// Version 1: records and their last synced snapshots
const MIGRATION_V1: &str = "
    CREATE TABLE IF NOT EXISTS schema_version (
        version INTEGER PRIMARY KEY
    );
    CREATE TABLE IF NOT EXISTS records (
        id TEXT PRIMARY KEY,
        entity_kind TEXT NOT NULL,
        category_id TEXT,
        sync_status TEXT NOT NULL,
        updated_at INTEGER NOT NULL,
        is_deleted INTEGER NOT NULL DEFAULT 0,
        payload TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_records_kind ON records(entity_kind);
    CREATE INDEX IF NOT EXISTS idx_records_category ON records(category_id);
    CREATE INDEX IF NOT EXISTS idx_records_status ON records(sync_status);
    CREATE INDEX IF NOT EXISTS idx_records_updated ON records(updated_at);
    CREATE TABLE IF NOT EXISTS record_bases (
        id TEXT PRIMARY KEY,
        payload TEXT NOT NULL
    );
";

/// Version 2: pending operation log
const MIGRATION_V2: &str = "
    CREATE TABLE IF NOT EXISTS pending_operations (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        record_id TEXT NOT NULL,
        entity_kind TEXT NOT NULL,
        kind TEXT NOT NULL,
        enqueued_at INTEGER NOT NULL,
        retry_count INTEGER NOT NULL DEFAULT 0,
        next_attempt_at INTEGER NOT NULL,
        last_error TEXT,
        payload TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_pending_operations_order
        ON pending_operations(enqueued_at, seq);
    CREATE INDEX IF NOT EXISTS idx_pending_operations_record
        ON pending_operations(record_id);
";

/// Version 3: conflicts and sync watermarks
const MIGRATION_V3: &str = "
    CREATE TABLE IF NOT EXISTS conflicts (
        id TEXT PRIMARY KEY,
        entity_kind TEXT NOT NULL,
        kind TEXT NOT NULL,
        detected_at INTEGER NOT NULL,
        payload TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_conflicts_detected_at ON conflicts(detected_at);
    CREATE TABLE IF NOT EXISTS sync_metadata (
        entity_kind TEXT PRIMARY KEY,
        last_sync_at INTEGER NOT NULL
    );
";
