use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use memosync_core::{EntityKind, ResolutionChoice};

#[derive(Parser)]
#[command(name = "memosync")]
#[command(about = "Offline-first memos that sync when you are back online")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Capture a new memo
    #[command(alias = "new")]
    Add {
        /// Memo content; #tags in the text are picked up automatically
        content: Vec<String>,
        /// Memo title (defaults to the first line of the content)
        #[arg(short, long)]
        title: Option<String>,
        /// Category id or unique id prefix
        #[arg(short, long)]
        category: Option<String>,
        /// Extra tag (repeatable)
        #[arg(long = "tag", value_name = "TAG")]
        tags: Vec<String>,
    },
    /// List memos or categories
    List {
        /// What to list
        #[arg(long, value_enum, default_value_t = KindArg::Memo)]
        kind: KindArg,
        /// Only memos in this category (id or unique prefix)
        #[arg(short, long)]
        category: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Edit an existing memo
    Edit {
        /// Memo ID or unique ID prefix
        id: String,
        /// New title
        #[arg(short, long)]
        title: Option<String>,
        /// New content
        #[arg(long)]
        content: Option<String>,
        /// Move to category (id or unique prefix)
        #[arg(short, long)]
        category: Option<String>,
        /// Replace tags (repeatable)
        #[arg(long = "tag", value_name = "TAG")]
        tags: Vec<String>,
    },
    /// Delete a memo or category
    Delete {
        /// Record ID or unique ID prefix
        id: String,
    },
    /// Manage categories
    Category {
        #[command(subcommand)]
        command: CategoryCommands,
    },
    /// Show pending work, conflicts and the last sync time
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Pull server changes and push queued work
    Sync,
    /// List unresolved sync conflicts
    Conflicts {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Resolve a sync conflict
    Resolve {
        /// Record ID or unique ID prefix
        id: String,
        /// Which side wins
        #[arg(value_enum)]
        choice: ChoiceArg,
    },
}

#[derive(Subcommand)]
pub enum CategoryCommands {
    /// Create a category
    Add {
        name: String,
        /// `#rrggbb` hex color
        #[arg(long, default_value = "#808080")]
        color: String,
    },
    /// Rename or recolor a category
    Edit {
        /// Category ID or unique ID prefix
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        color: Option<String>,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum KindArg {
    Memo,
    Category,
}

impl From<KindArg> for EntityKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Memo => Self::Memo,
            KindArg::Category => Self::Category,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum ChoiceArg {
    /// Keep the local version and push it
    Local,
    /// Accept the server version
    Server,
    /// Accept the suggested merge
    Merge,
}

impl From<ChoiceArg> for ResolutionChoice {
    fn from(choice: ChoiceArg) -> Self {
        match choice {
            ChoiceArg::Local => Self::Local,
            ChoiceArg::Server => Self::Server,
            ChoiceArg::Merge => Self::MergeSuggestion,
        }
    }
}
