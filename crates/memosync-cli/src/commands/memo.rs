use std::path::Path;

use memosync_core::models::extract_tags;
use memosync_core::{EntityKind, Memo, RecordBody};

use crate::commands::common::{
    category_names, default_title, format_record_lines, normalize_content, now_ms, open_engine,
    record_to_list_item, resolve_memo_content, resolve_record, short_id, Engine, RecordListItem,
};
use crate::error::CliError;

pub struct MemoEdit {
    pub title: Option<String>,
    pub content: Option<String>,
    pub category: Option<String>,
    pub tags: Vec<String>,
}

pub fn run_add(
    content_parts: &[String],
    title: Option<&str>,
    category: Option<&str>,
    tags: &[String],
    db_path: &Path,
) -> Result<(), CliError> {
    let content = resolve_memo_content(content_parts)?;
    let engine = open_engine(db_path)?;

    let title = title
        .and_then(normalize_content)
        .unwrap_or_else(|| default_title(&content));
    let mut memo = Memo::new(title, content.clone())
        .with_tags(extract_tags(&content))
        .with_tags(tags);
    if let Some(query) = category {
        let category = resolve_record(&engine, query, Some(EntityKind::Category))?;
        memo = memo.with_category(category.id);
    }

    let record = engine.create_memo(memo)?;
    println!("{}", record.id);
    Ok(())
}

pub fn run_list(
    kind: EntityKind,
    category: Option<&str>,
    as_json: bool,
    db_path: &Path,
) -> Result<(), CliError> {
    let engine = open_engine(db_path)?;
    let records = match category {
        Some(query) => {
            let category = resolve_record(&engine, query, Some(EntityKind::Category))?;
            engine.list_in_category(&category.id)?
        }
        None => engine.list(kind)?,
    };
    let categories = category_names(&engine)?;
    let now = now_ms();

    if as_json {
        let json_items = records
            .iter()
            .map(|record| record_to_list_item(record, &categories, now))
            .collect::<Vec<RecordListItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
    } else if records.is_empty() {
        println!("Nothing here yet.");
    } else {
        for line in format_record_lines(&records, &categories, now) {
            println!("{line}");
        }
    }

    Ok(())
}

pub fn run_edit(id: &str, edit: MemoEdit, db_path: &Path) -> Result<(), CliError> {
    let engine = open_engine(db_path)?;
    let record = resolve_record(&engine, id, Some(EntityKind::Memo))?;
    let RecordBody::Memo(current) = &record.body else {
        return Err(CliError::RecordNotFound(id.to_string()));
    };

    let memo = apply_memo_edit(&engine, current, edit)?;
    if &memo == current {
        println!("No changes");
        return Ok(());
    }

    let updated = engine.update_memo(&record.id, memo)?;
    println!("Updated {}", short_id(&updated.id));
    Ok(())
}

fn apply_memo_edit(engine: &Engine, current: &Memo, edit: MemoEdit) -> Result<Memo, CliError> {
    if edit.title.is_none() && edit.content.is_none() && edit.category.is_none() && edit.tags.is_empty()
    {
        return Err(CliError::NothingToEdit);
    }

    let mut memo = current.clone();
    if let Some(title) = edit.title {
        memo.title = title.trim().to_string();
    }
    if let Some(content) = edit.content {
        let content = normalize_content(&content).ok_or(CliError::EmptyContent)?;
        memo = memo.with_tags(extract_tags(&content));
        memo.content = content;
    }
    if let Some(query) = edit.category {
        let category = resolve_record(engine, &query, Some(EntityKind::Category))?;
        memo.category_id = Some(category.id);
    }
    if !edit.tags.is_empty() {
        memo.tags.clear();
        memo = memo.with_tags(&edit.tags);
    }
    Ok(memo)
}

pub fn run_delete(id: &str, db_path: &Path) -> Result<(), CliError> {
    let engine = open_engine(db_path)?;
    let record = resolve_record(&engine, id, None)?;
    engine.delete(&record.id)?;

    println!("Deleted {} {}", record.entity_kind(), short_id(&record.id));
    Ok(())
}
