//! Metadata store trait and SQLite implementation.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;

use super::error::StateError;
use super::schema;
use super::types::{PageProgress, SyncRun, SyncSummary};
use crate::catalog::{Cursor, Item};

/// Structured store operations.
///
/// Object-safe so the sync engine can take `&dyn MetadataStore`. Predicates
/// are SQL boolean expressions over the `posts` columns, supplied by the
/// user and passed through unparsed.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Insert or update posts keyed by id, in one transaction.
    async fn upsert(&self, items: &[Item]) -> Result<(), StateError>;

    async fn count_where(&self, predicate: &str) -> Result<u64, StateError>;

    /// Delete matching posts in one transaction, returning how many went.
    async fn delete_where(&self, predicate: &str) -> Result<u64, StateError>;

    /// Project `columns` of every matching post, rendered as text.
    async fn select_columns_where(
        &self,
        columns: &[&str],
        predicate: &str,
    ) -> Result<Vec<Vec<Option<String>>>, StateError>;

    /// Start a sync run and return its ID.
    async fn start_sync_run(&self, mode: &str) -> Result<i64, StateError>;

    /// Commit one page: upsert its items and record progress on the run,
    /// atomically.
    async fn commit_page(
        &self,
        run_id: i64,
        items: &[Item],
        progress: &PageProgress,
    ) -> Result<(), StateError>;

    async fn complete_sync_run(&self, run_id: i64) -> Result<(), StateError>;

    /// The most recently persisted cursor for `mode`, if any.
    async fn last_cursor(&self, mode: &str) -> Result<Option<Cursor>, StateError>;

    async fn get_summary(&self) -> Result<SyncSummary, StateError>;
}

/// SQLite implementation of the metadata store.
pub struct SqliteMetadataDb {
    /// Wrapped in Mutex because rusqlite::Connection is not Sync.
    conn: Mutex<Connection>,
    /// Path to the database file (for error messages).
    path: PathBuf,
}

impl std::fmt::Debug for SqliteMetadataDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteMetadataDb")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteMetadataDb {
    /// Open or create a database at the given path.
    pub async fn open(path: &Path) -> Result<Self, StateError> {
        let path = path.to_path_buf();
        let path_clone = path.clone();

        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&path_clone).map_err(|e| StateError::Open {
                path: path_clone.clone(),
                source: e,
            })?;

            conn.pragma_update(None, "journal_mode", "WAL")
                .map_err(StateError::Migration)?;
            conn.pragma_update(None, "synchronous", "NORMAL")
                .map_err(StateError::Migration)?;

            schema::migrate(&conn)?;

            Ok::<_, StateError>(conn)
        })
        .await??;

        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// Open an in-memory database (for testing).
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StateError> {
        let conn = Connection::open_in_memory().map_err(|e| StateError::Open {
            path: PathBuf::from(":memory:"),
            source: e,
        })?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: PathBuf::from(":memory:"),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StateError> {
        self.conn
            .lock()
            .map_err(|e| StateError::Query(e.to_string()))
    }
}

#[async_trait]
impl MetadataStore for SqliteMetadataDb {
    async fn upsert(&self, items: &[Item]) -> Result<(), StateError> {
        if items.is_empty() {
            return Ok(());
        }
        let conn = self.lock()?;
        in_transaction(&conn, |conn| upsert_items(conn, items))
    }

    async fn count_where(&self, predicate: &str) -> Result<u64, StateError> {
        let predicate = check_predicate(predicate)?;
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row(
                &format!("SELECT COUNT(*) FROM posts WHERE ({predicate})"),
                [],
                |row| row.get(0),
            )
            .map_err(StateError::query)?;
        Ok(count as u64)
    }

    async fn delete_where(&self, predicate: &str) -> Result<u64, StateError> {
        let predicate = check_predicate(predicate)?;
        let conn = self.lock()?;
        in_transaction(&conn, |conn| {
            let rows = conn
                .execute(&format!("DELETE FROM posts WHERE ({predicate})"), [])
                .map_err(StateError::query)?;
            Ok(rows as u64)
        })
    }

    async fn select_columns_where(
        &self,
        columns: &[&str],
        predicate: &str,
    ) -> Result<Vec<Vec<Option<String>>>, StateError> {
        let predicate = check_predicate(predicate)?;
        if let Some(bad) = columns.iter().find(|c| !is_identifier(c)) {
            return Err(StateError::InvalidColumn((*bad).to_string()));
        }
        let projection = if columns.is_empty() {
            "id".to_string()
        } else {
            columns
                .iter()
                .map(|c| quote(c))
                .collect::<Vec<_>>()
                .join(", ")
        };

        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {projection} FROM posts WHERE ({predicate}) ORDER BY id"
            ))
            .map_err(StateError::query)?;
        let width = stmt.column_count();

        let rows = stmt
            .query_map([], |row| {
                (0..width)
                    .map(|i| row.get_ref(i).map(render_value))
                    .collect::<Result<Vec<_>, _>>()
            })
            .map_err(StateError::query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StateError::query)?;

        Ok(rows)
    }

    async fn start_sync_run(&self, mode: &str) -> Result<i64, StateError> {
        let started_at = Utc::now().timestamp();
        let conn = self.lock()?;

        conn.execute(
            "INSERT INTO sync_runs (started_at, mode) VALUES (?1, ?2)",
            rusqlite::params![started_at, mode],
        )
        .map_err(StateError::query)?;

        Ok(conn.last_insert_rowid())
    }

    async fn commit_page(
        &self,
        run_id: i64,
        items: &[Item],
        progress: &PageProgress,
    ) -> Result<(), StateError> {
        let conn = self.lock()?;
        in_transaction(&conn, |conn| {
            upsert_items(conn, items)?;
            let rows = conn
                .execute(
                    "UPDATE sync_runs SET next_cursor = ?1, pages = pages + 1, \
                     updated = updated + ?2, downloaded = downloaded + ?3, \
                     invalid = invalid + ?4 WHERE id = ?5",
                    rusqlite::params![
                        progress.next_cursor.to_string(),
                        progress.updated as i64,
                        progress.downloaded as i64,
                        progress.invalid as i64,
                        run_id,
                    ],
                )
                .map_err(StateError::query)?;
            if rows == 0 {
                return Err(StateError::Query(format!("unknown sync run {run_id}")));
            }
            Ok(())
        })
    }

    async fn complete_sync_run(&self, run_id: i64) -> Result<(), StateError> {
        let completed_at = Utc::now().timestamp();
        let conn = self.lock()?;

        conn.execute(
            "UPDATE sync_runs SET completed_at = ?1 WHERE id = ?2",
            rusqlite::params![completed_at, run_id],
        )
        .map_err(StateError::query)?;

        Ok(())
    }

    async fn last_cursor(&self, mode: &str) -> Result<Option<Cursor>, StateError> {
        let conn = self.lock()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT next_cursor FROM sync_runs \
                 WHERE mode = ?1 AND next_cursor IS NOT NULL \
                 ORDER BY id DESC LIMIT 1",
                [mode],
                |row| row.get(0),
            )
            .optional()
            .map_err(StateError::query)?;

        Ok(raw.and_then(|s| match s.parse::<Cursor>() {
            Ok(cursor) => Some(cursor),
            Err(e) => {
                tracing::warn!(cursor = %s, error = %e, "Ignoring unreadable stored cursor");
                None
            }
        }))
    }

    async fn get_summary(&self) -> Result<SyncSummary, StateError> {
        let conn = self.lock()?;

        let total_posts: u64 = conn
            .query_row("SELECT COUNT(*) FROM posts", [], |row| row.get::<_, i64>(0))
            .map_err(StateError::query)? as u64;

        let last_run = conn
            .query_row(
                "SELECT id, started_at, completed_at, mode, next_cursor, pages, updated, \
                 downloaded, invalid FROM sync_runs ORDER BY id DESC LIMIT 1",
                [],
                row_to_sync_run,
            )
            .optional()
            .map_err(StateError::query)?;

        Ok(SyncSummary {
            total_posts,
            last_run,
        })
    }
}

/// Run `f` inside `BEGIN`/`COMMIT`, rolling back on any error.
fn in_transaction<T>(
    conn: &Connection,
    f: impl FnOnce(&Connection) -> Result<T, StateError>,
) -> Result<T, StateError> {
    conn.execute("BEGIN TRANSACTION", [])
        .map_err(StateError::query)?;

    match f(conn) {
        Ok(value) => {
            if let Err(e) = conn.execute("COMMIT", []) {
                let _ = conn.execute("ROLLBACK", []);
                return Err(StateError::query(e));
            }
            Ok(value)
        }
        Err(e) => {
            let _ = conn.execute("ROLLBACK", []);
            Err(e)
        }
    }
}

fn upsert_items(conn: &Connection, items: &[Item]) -> Result<(), StateError> {
    let mut known = existing_columns(conn)?;

    for item in items {
        let mut names: Vec<&str> = vec!["id"];
        let mut seen: HashSet<String> = HashSet::from(["id".to_string()]);
        let mut values: Vec<SqlValue> = vec![SqlValue::Integer(item.id as i64)];

        for (key, value) in &item.raw {
            if !is_identifier(key) {
                tracing::warn!(id = item.id, attribute = %key, "Skipping attribute with unusable name");
                continue;
            }
            // SQLite column names are case-insensitive.
            let folded = key.to_ascii_lowercase();
            if !seen.insert(folded.clone()) {
                continue;
            }
            if !known.contains(&folded) {
                conn.execute(
                    &format!(
                        "ALTER TABLE posts ADD COLUMN {} {}",
                        quote(key),
                        column_type(value)
                    ),
                    [],
                )
                .map_err(StateError::query)?;
                tracing::debug!(column = %key, "Added posts column");
                known.insert(folded);
            }
            names.push(key.as_str());
            values.push(to_sql_value(value));
        }

        let columns = names.iter().map(|n| quote(n)).collect::<Vec<_>>().join(", ");
        let placeholders = (1..=names.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let on_conflict = if names.len() == 1 {
            "DO NOTHING".to_string()
        } else {
            let sets = names[1..]
                .iter()
                .map(|n| format!("{0} = excluded.{0}", quote(n)))
                .collect::<Vec<_>>()
                .join(", ");
            format!("DO UPDATE SET {sets}")
        };

        conn.prepare_cached(&format!(
            "INSERT INTO posts ({columns}) VALUES ({placeholders}) ON CONFLICT(id) {on_conflict}"
        ))
        .and_then(|mut stmt| stmt.execute(rusqlite::params_from_iter(values.iter())))
        .map_err(StateError::query)?;
    }

    Ok(())
}

fn existing_columns(conn: &Connection) -> Result<HashSet<String>, StateError> {
    let mut stmt = conn
        .prepare("PRAGMA table_info(posts)")
        .map_err(StateError::query)?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))
        .map_err(StateError::query)?
        .map(|r| r.map(|name| name.to_ascii_lowercase()))
        .collect::<Result<HashSet<_>, _>>()
        .map_err(StateError::query)?;
    Ok(columns)
}

/// `[A-Za-z_][A-Za-z0-9_]*`
fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn quote(name: &str) -> String {
    format!("\"{name}\"")
}

fn check_predicate(predicate: &str) -> Result<&str, StateError> {
    let trimmed = predicate.trim();
    if trimmed.is_empty() {
        return Err(StateError::EmptyPredicate);
    }
    Ok(trimmed)
}

fn column_type(value: &Value) -> &'static str {
    match value {
        Value::Bool(_) => "INTEGER",
        Value::Number(n) if n.is_i64() || n.is_u64() => "INTEGER",
        Value::Number(_) => "REAL",
        Value::String(_) | Value::Array(_) | Value::Object(_) => "TEXT",
        Value::Null => "",
    }
}

fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => SqlValue::Integer(i),
            (None, Some(f)) => SqlValue::Real(f),
            (None, None) => SqlValue::Text(n.to_string()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn render_value(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Text(t) | ValueRef::Blob(t) => Some(String::from_utf8_lossy(t).into_owned()),
    }
}

fn row_to_sync_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncRun> {
    let started_at: Option<i64> = row.get(1)?;
    let completed_at: Option<i64> = row.get(2)?;
    let next_cursor: Option<String> = row.get(4)?;
    Ok(SyncRun {
        id: row.get(0)?,
        started_at: started_at.and_then(|ts| Utc.timestamp_opt(ts, 0).single()),
        completed_at: completed_at.and_then(|ts| Utc.timestamp_opt(ts, 0).single()),
        mode: row.get(3)?,
        next_cursor: next_cursor.and_then(|s| s.parse().ok()),
        pages: row.get::<_, i64>(5)? as u64,
        updated: row.get::<_, i64>(6)? as u64,
        downloaded: row.get::<_, i64>(7)? as u64,
        invalid: row.get::<_, i64>(8)? as u64,
    })
}
