//! Types for the structured store.

use chrono::{DateTime, Utc};

use crate::catalog::Cursor;

/// Per-page counters committed together with the page's records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageProgress {
    /// Where the next page starts; persisted for `--resume`.
    pub next_cursor: Cursor,
    /// Posts whose metadata was new or changed and got written.
    pub updated: u64,
    /// Content files (re)written.
    pub downloaded: u64,
    /// Items dropped as invalid (malformed, unaddressable, failed fetch).
    pub invalid: u64,
}

/// One row of `sync_runs`.
#[derive(Debug, Clone)]
pub struct SyncRun {
    pub id: i64,
    pub started_at: Option<DateTime<Utc>>,
    /// `None` while running or if the run aborted.
    pub completed_at: Option<DateTime<Utc>>,
    pub mode: String,
    pub next_cursor: Option<Cursor>,
    pub pages: u64,
    pub updated: u64,
    pub downloaded: u64,
    pub invalid: u64,
}

/// Summary of the structured store, shown by `status`.
#[derive(Debug, Clone)]
pub struct SyncSummary {
    pub total_posts: u64,
    pub last_run: Option<SyncRun>,
}
