use std::path::Path;

use memosync_core::{Category, EntityKind, RecordBody};

use crate::commands::common::{open_engine, resolve_record, short_id};
use crate::error::CliError;

pub fn run_category_add(name: &str, color: &str, db_path: &Path) -> Result<(), CliError> {
    let engine = open_engine(db_path)?;
    let record = engine.create_category(Category::new(name.trim(), color.trim()))?;

    println!("{}", record.id);
    Ok(())
}

pub fn run_category_edit(
    id: &str,
    name: Option<&str>,
    color: Option<&str>,
    db_path: &Path,
) -> Result<(), CliError> {
    if name.is_none() && color.is_none() {
        return Err(CliError::NothingToEdit);
    }

    let engine = open_engine(db_path)?;
    let record = resolve_record(&engine, id, Some(EntityKind::Category))?;
    let RecordBody::Category(mut category) = record.body else {
        return Err(CliError::RecordNotFound(id.to_string()));
    };

    if let Some(name) = name {
        category.name = name.trim().to_string();
    }
    if let Some(color) = color {
        category.color = color.trim().to_string();
    }

    let updated = engine.update_category(&record.id, category)?;
    println!("Updated {}", short_id(&updated.id));
    Ok(())
}
