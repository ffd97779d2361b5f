//! Error types for the structured store.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StateError {
    /// Failed to open or create the database file.
    #[error("Failed to open database at {path}: {source}")]
    Open {
        path: PathBuf,
        source: rusqlite::Error,
    },

    #[error("Database migration failed: {0}")]
    Migration(#[from] rusqlite::Error),

    #[error("Database query failed: {0}")]
    Query(String),

    #[error("Failed to spawn blocking task: {0}")]
    Spawn(#[from] tokio::task::JoinError),

    /// The database schema version is newer than supported.
    #[error("Database schema version {found} is newer than supported version {expected}")]
    UnsupportedSchemaVersion { found: i32, expected: i32 },

    /// A caller-supplied column name is not a plain SQL identifier.
    #[error("Invalid column name {0:?}")]
    InvalidColumn(String),

    #[error("Predicate must not be empty")]
    EmptyPredicate,
}

impl StateError {
    /// Create a Query error from a rusqlite error.
    pub fn query(source: rusqlite::Error) -> Self {
        Self::Query(source.to_string())
    }
}
