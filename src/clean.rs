//! Bulk removal of posts selected by an SQL predicate.

use anyhow::{Context, Result};

use crate::state::MetadataStore;
use crate::store::{self, hash, Layout};

#[derive(Debug, Default, PartialEq, Eq)]
pub struct CleanSummary {
    pub matched: u64,
    pub files_removed: u64,
    pub rows_deleted: u64,
}

/// Delete every post matching `predicate`: files first, then rows.
///
/// `confirm` is called with the match count and may cancel. A file whose
/// hash is still referenced by a post outside the predicate is kept.
pub async fn run_clean(
    db: &dyn MetadataStore,
    layout: &Layout,
    predicate: &str,
    confirm: impl FnOnce(u64) -> std::io::Result<bool>,
) -> Result<CleanSummary> {
    let matched = db
        .count_where(predicate)
        .await
        .with_context(|| format!("Failed to count posts matching '{predicate}'"))?;
    let mut summary = CleanSummary {
        matched,
        ..CleanSummary::default()
    };

    if matched == 0 {
        tracing::info!("No posts match '{}'", predicate);
        return Ok(summary);
    }

    tracing::info!("{} posts match '{}' and will be deleted", matched, predicate);
    if !confirm(matched)? {
        tracing::info!("Cancelled");
        return Ok(summary);
    }

    let rows = db
        .select_columns_where(&["md5", "file_ext"], predicate)
        .await?;
    let mut seen = std::collections::HashSet::new();
    for row in rows {
        let (Some(md5), ext) = (row[0].clone(), row[1].clone()) else {
            continue;
        };
        if !hash::is_hex_digest(&md5) || !seen.insert(md5.clone()) {
            continue;
        }
        // NOT (predicate) is NULL rather than true on NULL columns.
        let shared = db
            .count_where(&format!(
                "md5 = '{md5}' AND id NOT IN (SELECT id FROM posts WHERE ({predicate}))"
            ))
            .await?;
        if shared > 0 {
            tracing::debug!("Keeping {} ({} other posts)", md5, shared);
            continue;
        }

        let ext = ext.unwrap_or_default();
        let mut paths = vec![layout.content_path(&md5, &ext), layout.sidecar_path(&md5)];
        let resized = layout.resized_path(&md5);
        if !paths.contains(&resized) {
            paths.push(resized);
        }
        for path in paths {
            if store::remove_if_exists(&path)
                .with_context(|| format!("Failed to delete {}", path.display()))?
            {
                tracing::debug!("Deleted {}", path.display());
                summary.files_removed += 1;
            }
        }
    }

    summary.rows_deleted = db
        .delete_where(predicate)
        .await
        .with_context(|| format!("Failed to delete posts matching '{predicate}'"))?;
    tracing::info!(
        "Deleted {} posts and {} files",
        summary.rows_deleted,
        summary.files_removed
    );
    Ok(summary)
}
