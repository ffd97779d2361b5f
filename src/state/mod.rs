//! Structured metadata store.
//!
//! SQLite-backed mirror of every committed post's full attribute set, plus a
//! record of sync runs. It provides:
//! - One-transaction-per-page commits (records and resume cursor together)
//! - Predicate queries and deletes for the `clean` command
//! - Status reporting

pub mod db;
pub mod error;
pub mod schema;
pub mod types;

pub use db::{MetadataStore, SqliteMetadataDb};
pub use error::StateError;
pub use types::{PageProgress, SyncRun, SyncSummary};
