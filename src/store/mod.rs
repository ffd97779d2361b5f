//! Local content-addressed store.
//!
//! Content and its metadata sidecar live side by side under
//! `images/<first two hex chars of md5>/`, so paths are a pure function of
//! the content hash and no two distinct contents ever write the same file.

pub mod hash;

use std::fs::FileTimes;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};

use crate::catalog::Item;

pub const IMAGES_DIR: &str = "images";
pub const DB_FILE: &str = "danbooru.sqlite";
pub const SIDECAR_SUFFIX: &str = "-danbooru.json";
/// Resized content is always re-encoded to this format.
pub const RESIZED_EXTENSION: &str = "png";

/// Path arithmetic for one store root.
#[derive(Debug, Clone)]
pub struct Layout {
    images: PathBuf,
}

impl Layout {
    pub fn new(root: &Path) -> Self {
        Self {
            images: root.join(IMAGES_DIR),
        }
    }

    pub fn images_dir(&self) -> &Path {
        &self.images
    }

    /// Shard directory bounding per-directory fan-out.
    pub fn shard_dir(&self, md5: &str) -> PathBuf {
        self.images.join(md5.get(..2).unwrap_or(md5))
    }

    /// Verbatim content path with the catalog's extension.
    pub fn content_path(&self, md5: &str, extension: &str) -> PathBuf {
        let ext = clean_component(extension);
        if ext.is_empty() {
            self.shard_dir(md5).join(md5)
        } else {
            self.shard_dir(md5).join(format!("{md5}.{ext}"))
        }
    }

    /// Content path for resize output.
    pub fn resized_path(&self, md5: &str) -> PathBuf {
        self.content_path(md5, RESIZED_EXTENSION)
    }

    pub fn sidecar_path(&self, md5: &str) -> PathBuf {
        self.shard_dir(md5).join(format!("{md5}{SIDECAR_SUFFIX}"))
    }

    /// Scratch file for content being materialized. Derived from the hash so
    /// distinct items never share one.
    pub fn part_path(&self, md5: &str) -> PathBuf {
        self.shard_dir(md5).join(format!("{md5}.part"))
    }
}

/// Remove characters that are invalid in a path component: `/`, `\`, `:`,
/// `*`, `?`, `"`, `<`, `>`, `|`, and dots.
pub fn clean_component(s: &str) -> String {
    s.chars()
        .filter(|c| !matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | '.'))
        .collect()
}

/// What the sidecar at a hash-derived path says about previous syncs.
#[derive(Debug)]
pub enum Cached {
    /// No sidecar: never synced.
    Missing,
    /// A sidecar exists but cannot be read or parsed.
    Unreadable(String),
    Present(Box<Item>),
}

/// Load the cached item from its sidecar.
pub fn read_cached(layout: &Layout, md5: &str) -> Cached {
    let path = layout.sidecar_path(md5);
    let text = match std::fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Cached::Missing,
        Err(e) => return Cached::Unreadable(e.to_string()),
    };
    let value: serde_json::Value = match serde_json::from_str(&text) {
        Ok(v) => v,
        Err(e) => return Cached::Unreadable(e.to_string()),
    };
    match Item::from_record(value) {
        Ok(item) => Cached::Present(Box::new(item)),
        Err(e) => Cached::Unreadable(e.to_string()),
    }
}

/// Overwrite the sidecar with the item's full raw record.
pub fn write_sidecar(layout: &Layout, item: &Item) -> io::Result<()> {
    let json = serde_json::to_vec_pretty(&item.raw_value())?;
    let path = layout.sidecar_path(&item.md5);
    let part = path.with_extension("json.part");
    write_atomic(&path, &part, &json)
}

/// Delete a file, treating "already gone" as success.
///
/// Returns whether a file was actually removed.
pub fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Write `data` to `part` then rename it over `path`, so `path` only ever
/// holds complete content.
pub fn write_atomic(path: &Path, part: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(part, data)?;
    if let Err(e) = std::fs::rename(part, path) {
        let _ = std::fs::remove_file(part);
        return Err(e);
    }
    Ok(())
}

fn to_system_time(dt: &DateTime<Utc>) -> SystemTime {
    let ts = dt.timestamp();
    if ts >= 0 {
        UNIX_EPOCH + Duration::from_secs(ts as u64)
    } else {
        UNIX_EPOCH
            .checked_sub(Duration::from_secs(ts.unsigned_abs()))
            .unwrap_or(UNIX_EPOCH)
    }
}

/// Stamp a file with the post's timestamps: modification (and access) time
/// from `updated`, creation time from `created` where the platform allows
/// setting it.
pub fn set_file_times(
    path: &Path,
    created: &DateTime<Utc>,
    updated: &DateTime<Utc>,
) -> io::Result<()> {
    let modified = to_system_time(updated);
    #[allow(unused_mut)]
    let mut times = FileTimes::new().set_modified(modified).set_accessed(modified);

    #[cfg(target_os = "macos")]
    {
        use std::os::macos::fs::FileTimesExt;
        times = times.set_created(to_system_time(created));
    }
    #[cfg(windows)]
    {
        use std::os::windows::fs::FileTimesExt;
        times = times.set_created(to_system_time(created));
    }
    #[cfg(not(any(target_os = "macos", windows)))]
    let _ = created;

    let file = std::fs::File::options().write(true).open(path)?;
    file.set_times(times)
}
