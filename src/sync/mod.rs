//! Sync engine: walks the catalog page by page and converges the local
//! store onto it.
//!
//! Each page goes through normalize → plan+verify (concurrent) → fetch
//! (sequential) → commit → cursor advance. Pages are strictly ordered since
//! the next cursor depends on the ids of the previous page.

pub mod error;
pub mod fetch;
pub mod plan;
pub mod resize;

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::Client;
use serde_json::Value;

use crate::catalog::{CatalogClient, Credentials, Cursor, Item, PageRequest, Pagination};
use crate::retry::{self, Attempt, RetryConfig};
use crate::state::{MetadataStore, PageProgress};
use crate::store::Layout;

use fetch::Fetcher;
use plan::{Filters, PlanOutcome, VerifyContext};
use resize::ResizeConfig;

/// Subset of application config consumed by the sync engine.
/// Decoupled from CLI parsing so the engine can be tested independently.
#[derive(Debug, Clone)]
pub struct DumpConfig {
    pub(crate) output: PathBuf,
    pub(crate) pagination: Pagination,
    pub(crate) end_id: Option<u64>,
    /// Last page index to process; in id mode pages are counted from 1.
    pub(crate) end_page: Option<u64>,
    pub(crate) limit: u32,
    pub(crate) extensions: Vec<String>,
    pub(crate) include_deleted: bool,
    pub(crate) ignore_hash_check: bool,
    pub(crate) resize: Option<ResizeConfig>,
    pub(crate) threads: usize,
    pub(crate) retry: RetryConfig,
    pub(crate) resume: bool,
    pub(crate) max_content_bytes: u64,
    pub(crate) no_progress_bar: bool,
}

/// Totals for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DumpSummary {
    pub pages: u64,
    pub updated: u64,
    pub downloaded: u64,
    pub invalid: u64,
}

/// Create a progress bar with a consistent template.
///
/// Returns `ProgressBar::hidden()` when the user passed `--no-progress-bar` or
/// stdout is not a TTY.
fn create_progress_bar(no_progress_bar: bool, total: u64) -> ProgressBar {
    if no_progress_bar || !std::io::stdout().is_terminal() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::with_template(
            "[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
        )
        .expect("valid template")
        .progress_chars("=> "),
    );
    pb
}

/// Fetch one catalog page under the retry budget. Exhaustion and terminal
/// responses are both fatal to the run.
async fn fetch_page(
    catalog: &dyn CatalogClient,
    request: &PageRequest,
    retry_config: &RetryConfig,
) -> Result<Vec<Value>> {
    retry::retry_with_delay(retry_config, || async move {
        match catalog.fetch_page(request).await {
            Ok(records) => Attempt::Success(records),
            Err(e) if e.is_terminal() => Attempt::Terminal(e),
            Err(e) => Attempt::Transient(e),
        }
    })
    .await
    .with_context(|| {
        format!(
            "Failed to fetch catalog page {} for {:?}",
            request.page, request.tags
        )
    })
}

/// Entry point for the sync engine.
pub async fn run_dump(
    catalog: &dyn CatalogClient,
    http: &Client,
    credentials: Option<&Credentials>,
    db: &dyn MetadataStore,
    config: &DumpConfig,
) -> Result<DumpSummary> {
    let started = Instant::now();
    let pagination = &config.pagination;
    let layout = Layout::new(&config.output);

    let mut cursor = pagination.initial();
    if config.resume {
        match db.last_cursor(pagination.mode()).await? {
            Some(stored) if pagination.accepts(&stored) => {
                tracing::info!("Resuming from {}", stored);
                cursor = stored;
            }
            _ => tracing::info!("No stored cursor to resume from, starting at {}", cursor),
        }
    }

    let run_id = db.start_sync_run(pagination.mode()).await?;
    let filters = Filters::new(&config.extensions, config.include_deleted, config.end_id);
    let verify_ctx = Arc::new(VerifyContext {
        layout: layout.clone(),
        ignore_hash_check: config.ignore_hash_check,
        resize: config.resize,
    });
    let fetcher = Fetcher::new(
        http,
        credentials,
        &layout,
        config.resize,
        config.retry,
        config.max_content_bytes,
    );

    let mut totals = DumpSummary::default();
    let mut page_index = match cursor {
        Cursor::Page(page) => page,
        Cursor::Id(_) => 1,
    };

    loop {
        if config.end_page.is_some_and(|end| page_index > end) {
            tracing::info!("Reached page limit, stopping");
            break;
        }
        if let (Cursor::Id(next), Some(end)) = (cursor, config.end_id) {
            if next > end {
                tracing::info!("Reached end id {}, stopping", end);
                break;
            }
        }

        let request = pagination.request(&cursor, config.limit);
        let records = fetch_page(catalog, &request, &config.retry).await?;
        if records.is_empty() {
            tracing::info!("No more posts at {}", cursor);
            break;
        }
        let received = records.len();

        // Normalize
        let mut invalid: u64 = 0;
        let mut items: Vec<Item> = Vec::with_capacity(received);
        for record in records {
            match Item::from_record(record) {
                Ok(item) => items.push(item),
                Err(e) => {
                    tracing::warn!("Dropping malformed record: {}", e);
                    invalid += 1;
                }
            }
        }
        let Some(max_id) = items.iter().map(|item| item.id).max() else {
            tracing::info!("No usable records at {}, stopping", cursor);
            break;
        };

        // Filter
        let mut in_window = 0usize;
        let mut admitted: Vec<Item> = Vec::with_capacity(items.len());
        for item in items {
            match filters.check(&item) {
                Ok(()) => {
                    in_window += 1;
                    admitted.push(item);
                }
                Err(reason) => {
                    if !reason.outside_window() {
                        in_window += 1;
                    }
                    tracing::debug!(id = item.id, %reason, "Skipping post");
                }
            }
        }
        if in_window == 0 {
            tracing::info!("Every post at {} was filtered out, stopping", cursor);
            break;
        }

        // Plan + verify
        let outcomes = plan::plan_page(admitted, Arc::clone(&verify_ctx), config.threads)
            .await
            .context("Planning task panicked")?;
        let mut planned = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            match outcome {
                PlanOutcome::Valid(p) => planned.push(p),
                PlanOutcome::Invalid { id, reason } => {
                    tracing::warn!(id, "Skipping invalid post: {}", reason);
                    invalid += 1;
                }
            }
        }
        let to_fetch = planned.iter().filter(|p| p.plan.needs_fetch()).count();
        tracing::info!(
            "Page {} ({}): {} posts, {} valid, {} to fetch",
            page_index,
            cursor,
            received,
            planned.len(),
            to_fetch
        );

        // Fetch, strictly one at a time
        let pb = create_progress_bar(config.no_progress_bar, to_fetch as u64);
        let mut committed: Vec<Item> = Vec::with_capacity(planned.len());
        let mut downloaded: u64 = 0;
        let mut updated: u64 = 0;
        for p in planned {
            if !p.plan.needs_fetch() {
                committed.push(p.item);
                continue;
            }
            pb.set_message(format!("#{}", p.item.id));
            match fetcher.execute(&p).await {
                Ok(wrote) => {
                    if wrote {
                        downloaded += 1;
                    }
                    if p.plan.write_metadata {
                        updated += 1;
                    }
                    committed.push(p.item);
                }
                Err(e) => {
                    // indicatif needs `suspend` to keep log lines from
                    // garbling the bar.
                    pb.suspend(|| tracing::error!(id = p.item.id, "Invalidating post: {}", e));
                    invalid += 1;
                }
            }
            pb.inc(1);
        }
        pb.finish_and_clear();

        // Commit
        let next = pagination.advance(&cursor, max_id);
        let progress = PageProgress {
            next_cursor: next,
            updated,
            downloaded,
            invalid,
        };
        db.commit_page(run_id, &committed, &progress)
            .await
            .with_context(|| format!("Failed to commit page {}", page_index))?;

        tracing::info!(
            "  {} updated, {} downloaded, {} invalid; next {}",
            progress.updated,
            progress.downloaded,
            progress.invalid,
            next
        );

        totals.pages += 1;
        totals.updated += progress.updated;
        totals.downloaded += progress.downloaded;
        totals.invalid += progress.invalid;

        cursor = next;
        page_index += 1;
    }

    db.complete_sync_run(run_id).await?;

    tracing::info!("── Summary ──");
    tracing::info!(
        "  {} pages, {} updated, {} downloaded, {} invalid",
        totals.pages,
        totals.updated,
        totals.downloaded,
        totals.invalid
    );
    tracing::info!("  elapsed: {}", format_duration(started.elapsed()));

    Ok(totals)
}

fn format_duration(d: Duration) -> String {
    let total_secs = d.as_secs();
    let hours = total_secs / 3600;
    let mins = (total_secs % 3600) / 60;
    let secs = total_secs % 60;

    if hours > 0 {
        format!("{}h {:02}m {:02}s", hours, mins, secs)
    } else if mins > 0 {
        format!("{}m {:02}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}
