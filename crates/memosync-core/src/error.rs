//! Error types for memosync-core

use thiserror::Error;

use crate::remote::RemoteError;

/// Result type alias using memosync-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in memosync-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Record not found
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A three-way merge was requested without a base snapshot.
    #[error("Three-way merge requires a base snapshot (record {0})")]
    MissingBase(String),

    /// Remote store error
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),
}
