//! SQLite-backed storage driver.
//!
//! Two tables:
//!
//! ```text
//! ghost_files      path (PK) | content BLOB | deleted 0/1 | modified_at
//! ghost_revisions  path | revision | created_by | created_at   UNIQUE(path, revision)
//! ```
//!
//! Mutations made with `record_revision = true` append a revision row in the
//! same transaction. Deletes are soft (tombstone) when recorded and hard when
//! not; unrecorded mutations only come from replaying disk content, which
//! must not add history of its own.

use super::{ListingOptions, StorageDriver, apply_listing_options};
use crate::config::DEFAULT_REVISION_AUTHOR;
use crate::error::{Error, Result};
use crate::paths;
use crate::revision::Revision;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use std::path::{Path, PathBuf};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS ghost_files (
        path        TEXT PRIMARY KEY NOT NULL,
        content     BLOB NOT NULL,
        deleted     INTEGER NOT NULL DEFAULT 0,
        modified_at TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS ghost_revisions (
        path       TEXT NOT NULL,
        revision   TEXT NOT NULL,
        created_by TEXT NOT NULL,
        created_at TEXT NOT NULL,
        UNIQUE (path, revision)
    );
    CREATE INDEX IF NOT EXISTS idx_ghost_revisions_path ON ghost_revisions (path);
";

/// Matches rows whose path is `?1` or lies beneath it, per path segment.
const UNDER_PREFIX: &str =
    "(?1 = '' OR path = ?1 OR substr(path, 1, length(?1) + 1) = ?1 || '/')";

/// Stores files and a revision index in SQLite.
pub struct DbStorageDriver {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
    author: String,
}

impl std::fmt::Debug for DbStorageDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbStorageDriver")
            .field("path", &self.path)
            .field("author", &self.author)
            .finish()
    }
}

impl DbStorageDriver {
    /// Open (or create) a database file and make sure the schema exists.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let display = path.display().to_string();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| Error::io("create dir", parent, e))?;
        }

        let conn = Connection::open(&path).map_err(|e| Error::database("open", &display, e))?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            ",
        )
        .map_err(|e| Error::database("configure", &display, e))?;

        Self::with_connection(conn, Some(path))
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| Error::database("open", ":memory:", e))?;
        Self::with_connection(conn, None)
    }

    fn with_connection(conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .map_err(|e| Error::database("migrate", "schema", e))?;

        Ok(Self {
            conn: Mutex::new(conn),
            path,
            author: DEFAULT_REVISION_AUTHOR.to_string(),
        })
    }

    /// Set the author recorded on new revisions.
    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    /// Database file path (None for in-memory).
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Hard-delete soft-deleted rows under `prefix` that no longer have any
    /// revision in the index. Returns the number of rows removed.
    pub fn compact_deleted(&self, prefix: &str) -> Result<usize> {
        let conn = self.conn.lock();
        let sql = format!(
            "DELETE FROM ghost_files
             WHERE deleted = 1 AND {UNDER_PREFIX}
               AND NOT EXISTS (SELECT 1 FROM ghost_revisions r WHERE r.path = ghost_files.path)"
        );
        let removed = conn
            .execute(&sql, params![prefix])
            .map_err(|e| Error::database("compact", prefix, e))?;

        tracing::debug!(prefix, removed, "compacted soft-deleted rows");
        Ok(removed)
    }

    /// Append a revision row inside an open transaction.
    fn record(&self, tx: &Transaction<'_>, path: &str) -> Result<()> {
        let revision = Revision::new(path, self.author.as_str());
        tx.execute(
            "INSERT INTO ghost_revisions (path, revision, created_by, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                revision.path,
                revision.revision,
                revision.created_by,
                revision.created_on.to_rfc3339()
            ],
        )
        .map_err(|e| Error::database("record revision", path, e))?;
        Ok(())
    }

    /// Insert or replace a live row inside an open transaction.
    fn upsert_row(tx: &Transaction<'_>, path: &str, content: &[u8]) -> Result<()> {
        tx.execute(
            "INSERT INTO ghost_files (path, content, deleted, modified_at)
             VALUES (?1, ?2, 0, ?3)
             ON CONFLICT(path) DO UPDATE SET
                content = excluded.content,
                deleted = 0,
                modified_at = excluded.modified_at",
            params![path, content, Utc::now().to_rfc3339()],
        )
        .map_err(|e| Error::database("upsert", path, e))?;
        Ok(())
    }

    /// Flag a live row as deleted inside an open transaction.
    /// Returns whether a live row existed.
    fn soft_delete_row(tx: &Transaction<'_>, path: &str) -> Result<bool> {
        let changed = tx
            .execute(
                "UPDATE ghost_files SET deleted = 1, modified_at = ?2
                 WHERE path = ?1 AND deleted = 0",
                params![path, Utc::now().to_rfc3339()],
            )
            .map_err(|e| Error::database("delete", path, e))?;
        Ok(changed > 0)
    }
}

impl StorageDriver for DbStorageDriver {
    fn upsert_file(&self, path: &str, content: &[u8], record_revision: bool) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| Error::database("begin", path, e))?;

        Self::upsert_row(&tx, path, content)?;
        if record_revision {
            self.record(&tx, path)?;
        }

        tx.commit().map_err(|e| Error::database("commit", path, e))
    }

    fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT content FROM ghost_files WHERE path = ?1 AND deleted = 0",
            params![path],
            |row| row.get::<_, Vec<u8>>(0),
        )
        .optional()
        .map_err(|e| Error::database("read", path, e))?
        .ok_or_else(|| Error::not_found(path))
    }

    fn file_exists(&self, path: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let found = conn
            .query_row(
                "SELECT 1 FROM ghost_files WHERE path = ?1 AND deleted = 0",
                params![path],
                |_| Ok(()),
            )
            .optional()
            .map_err(|e| Error::database("exists", path, e))?;
        Ok(found.is_some())
    }

    fn delete_file(&self, path: &str, record_revision: bool) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| Error::database("begin", path, e))?;

        if record_revision {
            if Self::soft_delete_row(&tx, path)? {
                self.record(&tx, path)?;
            }
        } else {
            tx.execute("DELETE FROM ghost_files WHERE path = ?1", params![path])
                .map_err(|e| Error::database("delete", path, e))?;
        }

        tx.commit().map_err(|e| Error::database("commit", path, e))
    }

    fn delete_dir(&self, folder: &str) -> Result<()> {
        let live = self.directory_listing(folder, &ListingOptions::with_dot_files())?;

        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| Error::database("begin", folder, e))?;

        for relative in &live {
            let path = paths::join(&[folder, relative])?;
            if Self::soft_delete_row(&tx, &path)? {
                self.record(&tx, &path)?;
            }
        }

        tx.commit().map_err(|e| Error::database("commit", folder, e))
    }

    fn move_file(&self, from: &str, to: &str) -> Result<()> {
        let content = self.read_file(from)?;
        if from == to {
            return Ok(());
        }

        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| Error::database("begin", from, e))?;

        Self::upsert_row(&tx, to, &content)?;
        self.record(&tx, to)?;
        if Self::soft_delete_row(&tx, from)? {
            self.record(&tx, from)?;
        }

        tx.commit().map_err(|e| Error::database("commit", from, e))
    }

    fn directory_listing(&self, folder: &str, options: &ListingOptions) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT path FROM ghost_files WHERE deleted = 0 AND {UNDER_PREFIX}");

        let mut stmt = conn
            .prepare_cached(&sql)
            .map_err(|e| Error::database("list", folder, e))?;
        let rows = stmt
            .query_map(params![folder], |row| row.get::<_, String>(0))
            .map_err(|e| Error::database("list", folder, e))?;

        let mut relative = Vec::new();
        for row in rows {
            let path = row.map_err(|e| Error::database("list", folder, e))?;
            if let Some(rest) = paths::relative_to(&path, folder).filter(|r| !r.is_empty()) {
                relative.push(rest.to_string());
            }
        }

        Ok(apply_listing_options(relative, options))
    }

    fn list_revisions(&self, prefix: &str) -> Result<Vec<Revision>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT path, revision, created_by, created_at FROM ghost_revisions
             WHERE {UNDER_PREFIX} ORDER BY created_at, rowid"
        );

        let mut stmt = conn
            .prepare_cached(&sql)
            .map_err(|e| Error::database("list revisions", prefix, e))?;
        let rows = stmt
            .query_map(params![prefix], |row| {
                let created_at: String = row.get(3)?;
                let created_on = DateTime::parse_from_rfc3339(&created_at)
                    .map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(
                            3,
                            rusqlite::types::Type::Text,
                            Box::new(e),
                        )
                    })?
                    .with_timezone(&Utc);

                Ok(Revision {
                    path: row.get(0)?,
                    revision: row.get(1)?,
                    created_by: row.get(2)?,
                    created_on,
                })
            })
            .map_err(|e| Error::database("list revisions", prefix, e))?;

        let mut revisions = Vec::new();
        for row in rows {
            revisions.push(row.map_err(|e| Error::database("list revisions", prefix, e))?);
        }
        Ok(revisions)
    }

    fn delete_revision(&self, path: &str, revision: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM ghost_revisions WHERE path = ?1 AND revision = ?2",
            params![path, revision],
        )
        .map_err(|e| Error::database("delete revision", path, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tempfile::TempDir;

    fn driver() -> DbStorageDriver {
        DbStorageDriver::open_in_memory().unwrap()
    }

    #[test]
    fn test_open_file_database() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("state").join("ghost.db");

        {
            let driver = DbStorageDriver::open(&db_path).unwrap();
            driver.upsert_file("data/global/a.json", b"{}", true).unwrap();
            assert_eq!(driver.path(), Some(db_path.as_path()));
        }

        // Data survives reopening
        let driver = DbStorageDriver::open(&db_path).unwrap();
        assert_eq!(driver.read_file("data/global/a.json").unwrap(), b"{}");
        assert_eq!(driver.list_revisions("data/global").unwrap().len(), 1);
    }

    #[test]
    fn test_upsert_and_read() {
        let driver = driver();
        driver.upsert_file("data/global/a.json", b"one", true).unwrap();
        driver.upsert_file("data/global/a.json", b"two", true).unwrap();

        assert_eq!(driver.read_file("data/global/a.json").unwrap(), b"two");
        assert!(driver.file_exists("data/global/a.json").unwrap());
    }

    #[test]
    fn test_read_missing_is_not_found() {
        let driver = driver();
        assert!(driver.read_file("data/global/none").unwrap_err().is_not_found());
    }

    #[test]
    fn test_revision_bookkeeping() {
        let driver = driver();
        let prefix = "data/bots/bot1";

        driver.upsert_file("data/bots/bot1/qna/a.json", b"a", true).unwrap();
        assert_eq!(driver.list_revisions(prefix).unwrap().len(), 1);

        driver.upsert_file("data/bots/bot1/qna/a.json", b"b", false).unwrap();
        assert_eq!(driver.list_revisions(prefix).unwrap().len(), 1);

        driver.upsert_file("data/bots/bot1/qna/a.json", b"c", true).unwrap();
        let revisions = driver.list_revisions(prefix).unwrap();
        assert_eq!(revisions.len(), 2);

        let ids: HashSet<&str> = revisions.iter().map(|r| r.revision.as_str()).collect();
        assert_eq!(ids.len(), 2);
        assert!(revisions.iter().all(|r| r.created_by == "admin"));
    }

    #[test]
    fn test_revisions_respect_segment_prefix() {
        let driver = driver();
        driver.upsert_file("data/bots/bot1/a.json", b"a", true).unwrap();
        driver.upsert_file("data/bots/bot10/a.json", b"a", true).unwrap();

        assert_eq!(driver.list_revisions("data/bots/bot1").unwrap().len(), 1);
        assert_eq!(driver.list_revisions("data/bots").unwrap().len(), 2);
        assert_eq!(driver.list_revisions("").unwrap().len(), 2);
    }

    #[test]
    fn test_recorded_delete_is_soft() {
        let driver = driver().with_author("ops");
        driver.upsert_file("data/global/a.json", b"a", false).unwrap();
        driver.delete_file("data/global/a.json", true).unwrap();

        assert!(driver.read_file("data/global/a.json").unwrap_err().is_not_found());
        let revisions = driver.list_revisions("data/global").unwrap();
        assert_eq!(revisions.len(), 1);
        assert_eq!(revisions[0].created_by, "ops");

        // The tombstone is still there until compaction
        let rows: i64 = driver
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM ghost_files", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn test_unrecorded_delete_is_hard() {
        let driver = driver();
        driver.upsert_file("data/global/a.json", b"a", false).unwrap();
        driver.delete_file("data/global/a.json", false).unwrap();

        assert!(driver.list_revisions("data/global").unwrap().is_empty());
        let rows: i64 = driver
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM ghost_files", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 0);
    }

    #[test]
    fn test_upsert_revives_deleted_row() {
        let driver = driver();
        driver.upsert_file("data/global/a.json", b"a", true).unwrap();
        driver.delete_file("data/global/a.json", true).unwrap();
        driver.upsert_file("data/global/a.json", b"again", true).unwrap();

        assert_eq!(driver.read_file("data/global/a.json").unwrap(), b"again");
        assert_eq!(driver.list_revisions("data/global").unwrap().len(), 3);
    }

    #[test]
    fn test_delete_missing_records_nothing() {
        let driver = driver();
        driver.delete_file("data/global/none.json", true).unwrap();
        assert!(driver.list_revisions("data/global").unwrap().is_empty());
    }

    #[test]
    fn test_directory_listing() {
        let driver = driver();
        driver.upsert_file("data/global/a.json", b"", false).unwrap();
        driver.upsert_file("data/global/sub/b.json", b"", false).unwrap();
        driver.upsert_file("data/global/.hidden", b"", false).unwrap();
        driver.upsert_file("data/globalish/c.json", b"", false).unwrap();
        driver.upsert_file("data/global/gone.json", b"", false).unwrap();
        driver.delete_file("data/global/gone.json", true).unwrap();

        let listing = driver
            .directory_listing("data/global", &ListingOptions::default())
            .unwrap();
        assert_eq!(listing, vec!["a.json".to_string(), "sub/b.json".to_string()]);

        let top = driver
            .directory_listing("data/global", &ListingOptions::with_dot_files().top_level())
            .unwrap();
        assert_eq!(top, vec![".hidden".to_string(), "a.json".to_string()]);

        assert!(
            driver
                .directory_listing("data/missing", &ListingOptions::default())
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn test_delete_dir_records_each_file() {
        let driver = driver();
        driver.upsert_file("data/global/x/a.json", b"", false).unwrap();
        driver.upsert_file("data/global/x/y/b.json", b"", false).unwrap();
        driver.upsert_file("data/global/z.json", b"", false).unwrap();

        driver.delete_dir("data/global/x").unwrap();

        let listing = driver
            .directory_listing("data/global", &ListingOptions::default())
            .unwrap();
        assert_eq!(listing, vec!["z.json".to_string()]);
        assert_eq!(driver.list_revisions("data/global/x").unwrap().len(), 2);
    }

    #[test]
    fn test_move_file() {
        let driver = driver();
        driver.upsert_file("data/global/a.json", b"a", false).unwrap();
        driver.move_file("data/global/a.json", "data/global/b.json").unwrap();

        assert!(!driver.file_exists("data/global/a.json").unwrap());
        assert_eq!(driver.read_file("data/global/b.json").unwrap(), b"a");
        assert_eq!(driver.list_revisions("data/global").unwrap().len(), 2);
        assert!(
            driver
                .move_file("data/global/none", "data/global/c")
                .unwrap_err()
                .is_not_found()
        );
    }

    #[test]
    fn test_move_file_onto_itself() {
        let driver = driver();
        driver.upsert_file("data/global/a.json", b"a", false).unwrap();
        driver.move_file("data/global/a.json", "data/global/a.json").unwrap();

        assert_eq!(driver.read_file("data/global/a.json").unwrap(), b"a");
        assert!(driver.list_revisions("data/global").unwrap().is_empty());
        assert!(
            driver
                .move_file("data/global/none", "data/global/none")
                .unwrap_err()
                .is_not_found()
        );
    }

    #[test]
    fn test_delete_revision() {
        let driver = driver();
        driver.upsert_file("data/global/a.json", b"a", true).unwrap();
        driver.upsert_file("data/global/a.json", b"b", true).unwrap();

        let revisions = driver.list_revisions("data/global").unwrap();
        driver
            .delete_revision(&revisions[0].path, &revisions[0].revision)
            .unwrap();

        let remaining = driver.list_revisions("data/global").unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].revision, revisions[1].revision);
    }

    #[test]
    fn test_compact_deleted_keeps_unsynced_tombstones() {
        let driver = driver();
        driver.upsert_file("data/global/a.json", b"a", false).unwrap();
        driver.upsert_file("data/global/b.json", b"b", false).unwrap();
        driver.delete_file("data/global/a.json", true).unwrap();
        driver.delete_file("data/global/b.json", true).unwrap();

        // Only b's deletion has been synced
        let revisions = driver.list_revisions("data/global/b.json").unwrap();
        driver
            .delete_revision(&revisions[0].path, &revisions[0].revision)
            .unwrap();

        assert_eq!(driver.compact_deleted("data/global").unwrap(), 1);
        assert_eq!(driver.compact_deleted("data/global").unwrap(), 0);
    }
}
