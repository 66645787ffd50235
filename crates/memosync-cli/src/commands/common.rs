use std::collections::BTreeMap;
use std::env;
use std::io::{self, IsTerminal, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use memosync_core::{
    Conflict, CycleReport, EntityKind, HttpRemote, Record, RecordBody, RecordId, SqliteStore,
    SyncEngine, SyncStatus, SyncSummary,
};
use serde::Serialize;

use crate::config::CliConfig;
use crate::error::CliError;
use crate::remote::CliRemote;

pub type Engine = SyncEngine<SqliteStore, CliRemote>;

const SHORT_ID_LEN: usize = 13;

#[derive(Debug, Serialize)]
pub struct RecordListItem {
    pub id: String,
    pub kind: EntityKind,
    pub preview: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub relative_time: String,
    pub sync_status: SyncStatus,
}

#[derive(Debug, Serialize)]
pub struct ConflictItem {
    pub id: String,
    pub entity_kind: EntityKind,
    pub kind: String,
    pub local: String,
    pub server: Option<String>,
    pub has_base: bool,
    pub detected_at: i64,
    pub detected_at_iso: String,
}

pub fn open_engine(db_path: &Path) -> Result<Engine, CliError> {
    open_engine_with(db_path, false)
}

pub fn open_sync_engine(db_path: &Path) -> Result<Engine, CliError> {
    open_engine_with(db_path, true)
}

fn open_engine_with(db_path: &Path, require_sync: bool) -> Result<Engine, CliError> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let config = CliConfig::load().map_err(CliError::Config)?;
    let remote = match config.remote_url().map_err(CliError::Config)? {
        Some(url) => {
            tracing::debug!("Using remote {url}");
            CliRemote::Http(HttpRemote::new(url, config.auth_token.clone())?)
        }
        None => CliRemote::Unconfigured,
    };
    if require_sync && !remote.is_configured() {
        return Err(CliError::SyncNotConfigured);
    }

    let store = Arc::new(SqliteStore::open(db_path)?);
    Ok(SyncEngine::new(store, remote, config.engine)?)
}

pub fn resolve_db_path(cli_db_path: Option<PathBuf>) -> Result<PathBuf, CliError> {
    if let Some(path) = cli_db_path.or_else(|| env::var_os("MEMOSYNC_DB_PATH").map(PathBuf::from))
    {
        return Ok(path);
    }
    default_db_path()
}

pub fn default_db_path() -> Result<PathBuf, CliError> {
    dirs::data_dir()
        .map(|dir| dir.join("memosync").join("memosync.db"))
        .ok_or_else(|| CliError::Config("Failed to resolve CLI data directory".to_string()))
}

/// Resolve a full id or a unique id prefix against `candidates`
pub fn match_record_id<'a, I>(query: &str, candidates: I) -> Result<RecordId, CliError>
where
    I: IntoIterator<Item = &'a RecordId>,
{
    let query = normalize_record_identifier(query)?;
    let mut matches = Vec::new();
    for id in candidates {
        if id.as_str() == query {
            return Ok(id.clone());
        }
        if id.as_str().starts_with(&query) {
            matches.push(id);
        }
    }

    match matches.as_slice() {
        [] => Err(CliError::RecordNotFound(query)),
        [id] => Ok((*id).clone()),
        _ => {
            let options = matches
                .iter()
                .take(3)
                .map(|id| short_id(id))
                .collect::<Vec<_>>()
                .join(", ");
            Err(CliError::AmbiguousRecordId(format!(
                "ID prefix '{query}' is ambiguous; matches: {options}"
            )))
        }
    }
}

/// Find a live record by id or prefix, optionally of one kind
pub fn resolve_record(
    engine: &Engine,
    query: &str,
    kind: Option<EntityKind>,
) -> Result<Record, CliError> {
    let kinds = kind.map_or_else(|| EntityKind::ALL.to_vec(), |kind| vec![kind]);
    let mut records = Vec::new();
    for kind in kinds {
        records.extend(engine.list(kind)?);
    }

    let id = match_record_id(query, records.iter().map(|record| &record.id))?;
    records
        .into_iter()
        .find(|record| record.id == id)
        .ok_or_else(|| CliError::RecordNotFound(query.to_string()))
}

/// Category id to name, for list output
pub fn category_names(engine: &Engine) -> Result<BTreeMap<RecordId, String>, CliError> {
    Ok(engine
        .list(EntityKind::Category)?
        .into_iter()
        .filter_map(|record| {
            let name = record.category()?.name.clone();
            Some((record.id, name))
        })
        .collect())
}

pub fn short_id(id: &RecordId) -> String {
    id.as_str().chars().take(SHORT_ID_LEN).collect()
}

pub fn format_record_lines(
    records: &[Record],
    categories: &BTreeMap<RecordId, String>,
    now_ms: i64,
) -> Vec<String> {
    records
        .iter()
        .map(|record| {
            let short_id = short_id(&record.id);
            let preview = record_preview(record, 40);
            let relative_time = format_relative_time(record.updated_at, now_ms);
            let marker = status_marker(record.sync_status);
            let extra = match &record.body {
                RecordBody::Memo(memo) => {
                    let mut parts = Vec::new();
                    if let Some(name) = memo
                        .category_id
                        .as_ref()
                        .and_then(|id| categories.get(id))
                    {
                        parts.push(format!("[{name}]"));
                    }
                    parts.extend(memo.tags.iter().map(|tag| format!("#{tag}")));
                    parts.join(" ")
                }
                RecordBody::Category(category) => category.color.clone(),
            };

            if extra.is_empty() {
                format!("{short_id:<13} {marker} {preview:<40}  {relative_time}")
            } else {
                format!("{short_id:<13} {marker} {preview:<40}  {relative_time:<10}  {extra}")
            }
        })
        .collect()
}

const fn status_marker(status: SyncStatus) -> char {
    match status {
        SyncStatus::Synced => ' ',
        SyncStatus::Pending => '*',
        SyncStatus::Conflict => '!',
    }
}

pub fn record_to_list_item(
    record: &Record,
    categories: &BTreeMap<RecordId, String>,
    now_ms: i64,
) -> RecordListItem {
    let (category, tags) = match &record.body {
        RecordBody::Memo(memo) => (
            memo.category_id
                .as_ref()
                .map(|id| categories.get(id).cloned().unwrap_or_else(|| id.to_string())),
            memo.tags.iter().cloned().collect(),
        ),
        RecordBody::Category(_) => (None, Vec::new()),
    };

    RecordListItem {
        id: record.id.to_string(),
        kind: record.entity_kind(),
        preview: record_preview(record, 80),
        category,
        tags,
        created_at: record.created_at,
        updated_at: record.updated_at,
        relative_time: format_relative_time(record.updated_at, now_ms),
        sync_status: record.sync_status,
    }
}

pub fn record_preview(record: &Record, max_chars: usize) -> String {
    let collapsed = record
        .title_preview(usize::MAX)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");

    if collapsed.chars().count() <= max_chars {
        collapsed
    } else {
        let take_len = max_chars.saturating_sub(3);
        let mut truncated = collapsed.chars().take(take_len).collect::<String>();
        truncated.push_str("...");
        truncated
    }
}

pub fn conflict_to_item(conflict: &Conflict) -> ConflictItem {
    ConflictItem {
        id: conflict.id.to_string(),
        entity_kind: conflict.entity_kind,
        kind: conflict.kind.to_string(),
        local: snapshot_label(Some(&conflict.local_version)),
        server: conflict
            .server_version
            .as_ref()
            .map(|server| snapshot_label(Some(server))),
        has_base: conflict.base_version.is_some(),
        detected_at: conflict.detected_at,
        detected_at_iso: format_sync_timestamp(conflict.detected_at),
    }
}

pub fn format_conflict_lines(conflicts: &[Conflict]) -> Vec<String> {
    conflicts
        .iter()
        .map(|conflict| {
            format!(
                "{}  {:<13}  {:<8}  {:<13}  local={}  server={}",
                format_sync_timestamp(conflict.detected_at),
                short_id(&conflict.id),
                conflict.entity_kind,
                conflict.kind,
                snapshot_label(Some(&conflict.local_version)),
                snapshot_label(conflict.server_version.as_ref()),
            )
        })
        .collect()
}

fn snapshot_label(record: Option<&Record>) -> String {
    match record {
        None => "<deleted>".to_string(),
        Some(record) if record.is_deleted => "<deleted>".to_string(),
        Some(record) => format!("\"{}\"", record_preview(record, 30)),
    }
}

pub fn format_status_lines(summary: &SyncSummary) -> Vec<String> {
    let last_sync = summary
        .last_sync_at
        .map_or_else(|| "never".to_string(), format_sync_timestamp);
    vec![
        format!("Pending operations: {}", summary.pending_count),
        format!("Open conflicts:     {}", summary.conflict_count),
        format!("Last sync:          {last_sync}"),
        format!("Phase:              {}", summary.phase),
    ]
}

pub fn format_cycle_report(report: &CycleReport) -> String {
    let mut line = format!(
        "Sync completed: pulled {}, pushed {}/{}, conflicts {} ({} auto-resolved)",
        report.pulled,
        report.queue.applied,
        report.queue.attempted,
        report.conflicts_detected,
        report.auto_resolved,
    );
    if report.queue.evicted > 0 {
        line.push_str(&format!(", {} dropped", report.queue.evicted));
    }
    if report.unresolved > 0 {
        line.push_str(&format!(
            "\n{} conflict(s) need attention; run `memosync conflicts`",
            report.unresolved
        ));
    }
    line
}

pub fn format_sync_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;
    let week = 7 * day;
    let month = 30 * day;
    let year = 365 * day;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else if diff < week {
        format!("{}d ago", diff / day)
    } else if diff < month {
        format!("{}w ago", diff / week)
    } else if diff < year {
        format!("{}mo ago", diff / month)
    } else {
        format!("{}y ago", diff / year)
    }
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn resolve_memo_content(content_parts: &[String]) -> Result<String, CliError> {
    if let Some(content) = normalize_content(&content_parts.join(" ")) {
        return Ok(content);
    }

    if let Some(content) = read_piped_stdin()? {
        return Ok(content);
    }

    Err(CliError::EmptyContent)
}

pub fn normalize_content(content: &str) -> Option<String> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub fn normalize_record_identifier(id: &str) -> Result<String, CliError> {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        Err(CliError::EmptyRecordId)
    } else {
        Ok(trimmed.to_string())
    }
}

/// Title for a memo captured without one: its first non-empty line
pub fn default_title(content: &str) -> String {
    content
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("")
        .chars()
        .take(80)
        .collect()
}

pub fn read_piped_stdin() -> Result<Option<String>, CliError> {
    let stdin = io::stdin();
    if stdin.is_terminal() {
        return Ok(None);
    }

    let mut buffer = String::new();
    stdin.lock().read_to_string(&mut buffer)?;
    Ok(normalize_content(&buffer))
}
