//! Per-item planning and cache verification.
//!
//! Every filter-surviving item is compared against its cached sidecar and,
//! unless already known stale, its local content is hash-verified. Items are
//! planned independently on the blocking pool; the caller awaits the whole
//! page before fetching anything.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::stream::{self, StreamExt};

use super::resize::ResizeConfig;
use crate::catalog::Item;
use crate::store::hash::{is_hex_digest, md5_file};
use crate::store::{self, Cached, Layout};

/// What the fetch stage has to do for one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Plan {
    pub download: bool,
    pub write_metadata: bool,
}

impl Plan {
    pub fn needs_fetch(&self) -> bool {
        self.download || self.write_metadata
    }
}

#[derive(Debug, Clone)]
pub struct PlannedItem {
    pub item: Item,
    pub plan: Plan,
}

#[derive(Debug)]
pub enum PlanOutcome {
    Valid(PlannedItem),
    /// The item cannot be content-addressed; it is neither fetched nor
    /// committed.
    Invalid { id: u64, reason: &'static str },
}

/// Why an item was excluded before planning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exclusion {
    Extension,
    BeyondEndId,
    Deleted,
    Pending,
}

impl Exclusion {
    /// Whether the item lies outside the requested catalog window, as
    /// opposed to being inside it but not wanted right now.
    pub fn outside_window(&self) -> bool {
        matches!(self, Exclusion::Extension | Exclusion::BeyondEndId)
    }
}

impl fmt::Display for Exclusion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Exclusion::Extension => "extension not allowed",
            Exclusion::BeyondEndId => "beyond end id",
            Exclusion::Deleted => "deleted",
            Exclusion::Pending => "pending",
        })
    }
}

/// Pre-plan filters.
#[derive(Debug, Clone)]
pub struct Filters {
    /// Lowercase; empty admits every extension.
    extensions: HashSet<String>,
    include_deleted: bool,
    end_id: Option<u64>,
}

impl Filters {
    pub fn new(extensions: &[String], include_deleted: bool, end_id: Option<u64>) -> Self {
        Self {
            extensions: extensions
                .iter()
                .map(|e| e.trim().trim_start_matches('.').to_ascii_lowercase())
                .filter(|e| !e.is_empty())
                .collect(),
            include_deleted,
            end_id,
        }
    }

    pub fn check(&self, item: &Item) -> Result<(), Exclusion> {
        if !self.extensions.is_empty() && !self.extensions.contains(&item.extension) {
            return Err(Exclusion::Extension);
        }
        if self.end_id.is_some_and(|end| item.id > end) {
            return Err(Exclusion::BeyondEndId);
        }
        if item.is_deleted && !self.include_deleted {
            return Err(Exclusion::Deleted);
        }
        if item.is_pending {
            return Err(Exclusion::Pending);
        }
        Ok(())
    }
}

/// Everything verification needs, shared read-only across workers.
#[derive(Debug, Clone)]
pub struct VerifyContext {
    pub layout: Layout,
    pub ignore_hash_check: bool,
    pub resize: Option<ResizeConfig>,
}

/// Plan a page of items with at most `threads` in flight. Outcomes come
/// back in input order.
pub async fn plan_page(
    items: Vec<Item>,
    ctx: Arc<VerifyContext>,
    threads: usize,
) -> Result<Vec<PlanOutcome>, tokio::task::JoinError> {
    stream::iter(items)
        .map(|item| {
            let ctx = Arc::clone(&ctx);
            tokio::task::spawn_blocking(move || plan_item(item, &ctx))
        })
        .buffered(threads.max(1))
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .collect()
}

/// Plan one item. Blocking: reads the sidecar and may hash the content.
pub fn plan_item(item: Item, ctx: &VerifyContext) -> PlanOutcome {
    if !item.is_addressable() {
        return PlanOutcome::Invalid {
            id: item.id,
            reason: "missing md5 or file url",
        };
    }
    if !is_hex_digest(&item.md5) {
        return PlanOutcome::Invalid {
            id: item.id,
            reason: "md5 is not a 32-digit hex digest",
        };
    }

    let stale = match store::read_cached(&ctx.layout, &item.md5) {
        Cached::Missing => true,
        Cached::Unreadable(e) => {
            tracing::debug!(id = item.id, error = %e, "Unreadable sidecar, treating as new");
            true
        }
        Cached::Present(cached) => item.updated_at > cached.updated_at,
    };

    let download = content_needs_download(&item, ctx, stale);
    if download || stale {
        tracing::debug!(id = item.id, download, metadata = stale, "Planned fetch");
    }

    PlanOutcome::Valid(PlannedItem {
        item,
        plan: Plan {
            download,
            write_metadata: stale,
        },
    })
}

/// Decide whether the local content has to be (re)fetched.
///
/// Stale items are always hash-checked; otherwise hashing can be skipped
/// by configuration and only presence is checked.
fn content_needs_download(item: &Item, ctx: &VerifyContext, stale: bool) -> bool {
    let Some(local) = expected_content(&ctx.layout, item, ctx.resize.as_ref()) else {
        return true;
    };
    if !local.hashable {
        return false;
    }
    if ctx.ignore_hash_check && !stale {
        return false;
    }
    match md5_file(&local.path) {
        Ok(actual) if actual == item.md5 => false,
        Ok(actual) => {
            tracing::info!(
                id = item.id,
                expected = %item.md5,
                actual = %actual,
                "Local content does not match its hash, will re-download"
            );
            true
        }
        Err(e) => {
            tracing::warn!(
                id = item.id,
                path = %local.path.display(),
                error = %e,
                "Failed to hash local content, will re-download"
            );
            true
        }
    }
}

struct LocalContent {
    path: PathBuf,
    /// Resized output is not byte-identical to the catalog's content, so it
    /// can only be checked for presence.
    hashable: bool,
}

/// Locate the content file an earlier sync would have left for `item`.
fn expected_content(
    layout: &Layout,
    item: &Item,
    resize: Option<&ResizeConfig>,
) -> Option<LocalContent> {
    let verbatim = LocalContent {
        path: layout.content_path(&item.md5, &item.extension),
        hashable: true,
    };
    let Some(resize) = resize else {
        return verbatim.path.exists().then_some(verbatim);
    };
    let resized = LocalContent {
        path: layout.resized_path(&item.md5),
        hashable: false,
    };

    match item.declared_size {
        Some(size) if resize.applies_to(size) => resized.path.exists().then_some(resized),
        Some(_) => verbatim.path.exists().then_some(verbatim),
        None if resized.path.exists() => Some(resized),
        None => verbatim.path.exists().then_some(verbatim),
    }
}
