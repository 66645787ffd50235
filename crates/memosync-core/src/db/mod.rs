//! Local persistence for memosync

mod connection;
mod migrations;
mod store;

pub use connection::Database;
pub use store::{LocalStore, RecordIndex, SqliteStore};
