//! memosync CLI - offline-first memos from the command line
//!
//! Every command works against the local store; `sync` talks to the server.

mod cli;
mod commands;
mod config;
mod error;
mod remote;


use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{CategoryCommands, Cli, Commands};
use crate::commands::category::{run_category_add, run_category_edit};
use crate::commands::common::resolve_db_path;
use crate::commands::memo::{run_add, run_delete, run_edit, run_list, MemoEdit};
use crate::commands::sync::{run_conflicts, run_resolve, run_status, run_sync};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,memosync=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let db_path = resolve_db_path(cli.db_path)?;

    match cli.command {
        Commands::Add {
            content,
            title,
            category,
            tags,
        } => run_add(
            &content,
            title.as_deref(),
            category.as_deref(),
            &tags,
            &db_path,
        ),
        Commands::List {
            kind,
            category,
            json,
        } => run_list(kind.into(), category.as_deref(), json, &db_path),
        Commands::Edit {
            id,
            title,
            content,
            category,
            tags,
        } => run_edit(
            &id,
            MemoEdit {
                title,
                content,
                category,
                tags,
            },
            &db_path,
        ),
        Commands::Delete { id } => run_delete(&id, &db_path),
        Commands::Category { command } => match command {
            CategoryCommands::Add { name, color } => run_category_add(&name, &color, &db_path),
            CategoryCommands::Edit { id, name, color } => {
                run_category_edit(&id, name.as_deref(), color.as_deref(), &db_path)
            }
        },
        Commands::Status { json } => run_status(json, &db_path),
        Commands::Sync => run_sync(&db_path).await,
        Commands::Conflicts { json } => run_conflicts(json, &db_path),
        Commands::Resolve { id, choice } => run_resolve(&id, choice.into(), &db_path),
    }
}
