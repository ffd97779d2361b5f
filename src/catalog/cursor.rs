//! Pagination over the catalog.
//!
//! The catalog can be walked two ways: by ascending id (`id:>=N order:id_asc`,
//! always page 1) or by page number over an arbitrary tag query. Both are
//! expressed as a [`Cursor`] plus a [`Pagination`] that knows how to turn a
//! cursor into a request and how to advance it after a page.

use std::fmt;
use std::str::FromStr;

/// Opaque position in the catalog. Exactly one variant is used per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cursor {
    /// Next request starts at this id (inclusive).
    Id(u64),
    /// Next request fetches this 1-based page.
    Page(u64),
}

impl Cursor {
    /// Name of the pagination mode this cursor belongs to.
    pub fn mode(&self) -> &'static str {
        match self {
            Cursor::Id(_) => "id",
            Cursor::Page(_) => "page",
        }
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cursor::Id(id) => write!(f, "id:{id}"),
            Cursor::Page(page) => write!(f, "page:{page}"),
        }
    }
}

impl FromStr for Cursor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, n) = s
            .split_once(':')
            .ok_or_else(|| format!("malformed cursor {s:?}"))?;
        let n: u64 = n.parse().map_err(|_| format!("malformed cursor {s:?}"))?;
        match kind {
            "id" => Ok(Cursor::Id(n)),
            "page" => Ok(Cursor::Page(n)),
            _ => Err(format!("unknown cursor kind {kind:?}")),
        }
    }
}

/// Everything needed to request one page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub tags: String,
    pub page: u64,
    pub limit: u32,
}

/// How the run walks the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pagination {
    /// Ascending ids starting at `start_id`; `tags` further narrows the query.
    ById { start_id: u64, tags: String },
    /// Successive pages of `query`, starting at `start_page`.
    ByPage { start_page: u64, query: String },
}

impl Pagination {
    pub fn initial(&self) -> Cursor {
        match self {
            Pagination::ById { start_id, .. } => Cursor::Id(*start_id),
            Pagination::ByPage { start_page, .. } => Cursor::Page(*start_page),
        }
    }

    pub fn mode(&self) -> &'static str {
        self.initial().mode()
    }

    /// Whether `cursor` was produced by this pagination mode.
    pub fn accepts(&self, cursor: &Cursor) -> bool {
        matches!(
            (self, cursor),
            (Pagination::ById { .. }, Cursor::Id(_)) | (Pagination::ByPage { .. }, Cursor::Page(_))
        )
    }

    pub fn request(&self, cursor: &Cursor, limit: u32) -> PageRequest {
        match (self, cursor) {
            (Pagination::ById { tags, .. }, Cursor::Id(id)) => {
                let mut q = format!("id:>={id} order:id_asc");
                if !tags.trim().is_empty() {
                    q.push(' ');
                    q.push_str(tags.trim());
                }
                PageRequest {
                    tags: q,
                    page: 1,
                    limit,
                }
            }
            (Pagination::ByPage { query, .. }, Cursor::Page(page)) => PageRequest {
                tags: query.clone(),
                page: *page,
                limit,
            },
            // A cursor from the other mode carries no usable position.
            _ => self.request(&self.initial(), limit),
        }
    }

    /// Cursor for the page after the one just processed.
    ///
    /// `max_id` is the largest id observed on that page.
    pub fn advance(&self, cursor: &Cursor, max_id: u64) -> Cursor {
        match cursor {
            Cursor::Id(_) => Cursor::Id(max_id.saturating_add(1)),
            Cursor::Page(page) => Cursor::Page(page.saturating_add(1)),
        }
    }
}
