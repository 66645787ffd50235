use std::path::Path;

use memosync_core::{CycleOutcome, ResolutionChoice};

use crate::commands::common::{
    conflict_to_item, format_conflict_lines, format_cycle_report, format_status_lines,
    match_record_id, open_engine, open_sync_engine, short_id, ConflictItem,
};
use crate::error::CliError;

pub async fn run_sync(db_path: &Path) -> Result<(), CliError> {
    let engine = open_sync_engine(db_path)?;

    match engine.set_online(true).await? {
        Some(CycleOutcome::Completed(report)) => {
            tracing::debug!("Cycle report: {report:?}");
            println!("{}", format_cycle_report(&report));
        }
        Some(CycleOutcome::Busy) => println!("A sync is already running"),
        Some(CycleOutcome::Offline) | None => println!("Offline; nothing was synced"),
    }
    Ok(())
}

pub fn run_status(as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let engine = open_engine(db_path)?;
    let summary = engine.status()?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    for line in format_status_lines(&summary) {
        println!("{line}");
    }
    Ok(())
}

pub fn run_conflicts(as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let engine = open_engine(db_path)?;
    let conflicts = engine.conflicts()?;

    if as_json {
        let json_items = conflicts
            .iter()
            .map(conflict_to_item)
            .collect::<Vec<ConflictItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
        return Ok(());
    }

    if conflicts.is_empty() {
        println!("No sync conflicts.");
        return Ok(());
    }

    for line in format_conflict_lines(&conflicts) {
        println!("{line}");
    }
    Ok(())
}

pub fn run_resolve(id: &str, choice: ResolutionChoice, db_path: &Path) -> Result<(), CliError> {
    let engine = open_engine(db_path)?;
    let conflicts = engine.conflicts()?;
    let id = match_record_id(id, conflicts.iter().map(|conflict| &conflict.id))?;

    match engine.resolve_conflict(&id, choice)? {
        Some(record) => println!(
            "Resolved {} with {}; kept {}",
            short_id(&id),
            choice.as_str(),
            short_id(&record.id)
        ),
        None => println!("Resolved {} with {}; record removed", short_id(&id), choice.as_str()),
    }
    Ok(())
}
