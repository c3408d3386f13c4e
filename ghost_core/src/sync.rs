//! Reconciling the database with disk.
//!
//! Disk is the tracked source of truth; the database holds edits made at
//! runtime. A sync first forgets every DB revision that an export already
//! carried back to disk. If anything is left, those edits exist only in the
//! database and the sync stops without touching either side. Otherwise the
//! disk content of every trackable folder is replayed into the database.

use crate::driver::{ListingOptions, StorageDriver};
use crate::error::{Error, Result};
use crate::paths;
use crate::revision::{self, PendingRevisions, Revision};
use crate::scoped::ScopedGhost;
use serde::Serialize;
use std::collections::HashSet;

/// Counters for a completed sync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    /// Folders replayed, the scope root included.
    pub folders: usize,
    pub files_upserted: usize,
    pub files_deleted: usize,
    /// DB revisions dropped because disk already has them.
    pub revisions_cleared: usize,
}

/// Result of [`ScopedGhost::sync`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncOutcome {
    /// Not running in DB mode; nothing to reconcile.
    Disabled,
    /// Some DB revisions are not on disk yet. Nothing was replayed.
    Blocked { unsynced: usize },
    Synced(SyncStats),
}

impl ScopedGhost {
    /// Replay disk content into the database.
    ///
    /// Callers must not run two syncs, or a sync and writes, on the same
    /// scope at the same time.
    pub fn sync(&self) -> Result<SyncOutcome> {
        let Some(db) = self.backends.db.as_deref() else {
            return Ok(SyncOutcome::Disabled);
        };
        let disk = self.backends.disk.as_ref();

        let disk_revisions = self.list_disk_revisions()?;
        let db_revisions = db.list_revisions(&self.base_dir)?;

        let synced = revision::mirrored(&db_revisions, &disk_revisions);
        for rev in &synced {
            db.delete_revision(&rev.path, &rev.revision)?;
        }

        let mut stats = SyncStats {
            revisions_cleared: synced.len(),
            ..SyncStats::default()
        };

        let unsynced = db_revisions.len() - synced.len();
        if unsynced > 0 {
            tracing::warn!(
                scope = %self.name(),
                unsynced,
                "database has changes that are not on disk, skipping sync"
            );
            return Ok(SyncOutcome::Blocked { unsynced });
        }

        let folders = self.replay_folders()?;
        tracing::info!(
            scope = %self.name(),
            folders = folders.len(),
            "syncing disk into database"
        );

        for (folder, options) in folders {
            let dir = paths::join(&[&self.base_dir, &folder])?;
            let disk_files: Vec<String> = disk
                .directory_listing(&dir, &options)?
                .into_iter()
                .filter(|f| {
                    let relative = if folder.is_empty() {
                        f.clone()
                    } else {
                        format!("{folder}/{f}")
                    };
                    !self.is_sidecar(&relative)
                })
                .collect();
            let on_disk: HashSet<&str> = disk_files.iter().map(String::as_str).collect();

            for file in db.directory_listing(&dir, &options)? {
                if on_disk.contains(file.as_str()) {
                    continue;
                }
                let path = paths::join(&[&dir, &file])?;
                db.delete_file(&path, false)?;
                self.cache().invalidate(&path);
                stats.files_deleted += 1;
            }

            for file in &disk_files {
                let path = paths::join(&[&dir, file])?;
                let content = disk.read_file(&path)?;
                db.upsert_file(&path, &content, false)?;
                self.cache().invalidate(&path);
                stats.files_upserted += 1;
            }

            stats.folders += 1;
        }

        tracing::info!(
            scope = %self.name(),
            upserted = stats.files_upserted,
            deleted = stats.files_deleted,
            "sync complete"
        );
        Ok(SyncOutcome::Synced(stats))
    }

    /// Folders a sync replays, relative to the scope, with how each one is
    /// listed. A root holds loose files only; nested files belong to one of
    /// its trackable folders and must not be replayed twice. An aggregate
    /// applies that rule to each child folder.
    fn replay_folders(&self) -> Result<Vec<(String, ListingOptions)>> {
        let disk = self.backends.disk.as_ref();
        let loose = ListingOptions::with_dot_files().top_level();

        let mut folders = vec![(String::new(), loose.clone())];
        let roots = if self.is_read_only() {
            disk.subfolders(&self.base_dir)?
        } else {
            vec![String::new()]
        };

        for root in roots {
            if !root.is_empty() {
                folders.push((root.clone(), loose.clone()));
            }
            let dir = paths::join(&[&self.base_dir, &root])?;
            for name in disk.discover_trackable_folders(&dir)? {
                folders.push((paths::join(&[&root, &name])?, ListingOptions::with_dot_files()));
            }
        }
        Ok(folders)
    }

    /// Whether the database has no revision for this scope left to sync.
    /// Always true without a database.
    pub fn is_fully_synced(&self) -> Result<bool> {
        match self.backends.db.as_deref() {
            Some(db) => Ok(db.list_revisions(&self.base_dir)?.is_empty()),
            None => Ok(true),
        }
    }

    /// DB revisions of the scope grouped by top-level folder (`root` for
    /// loose files). Empty without a database.
    pub fn get_pending_changes(&self) -> Result<PendingRevisions> {
        match self.backends.db.as_deref() {
            Some(db) => Ok(revision::group_by_folder(
                &self.base_dir,
                db.list_revisions(&self.base_dir)?,
            )),
            None => Ok(PendingRevisions::new()),
        }
    }

    /// Revisions the database has recorded for this scope.
    pub fn list_db_revisions(&self) -> Result<Vec<Revision>> {
        match self.backends.db.as_deref() {
            Some(db) => db.list_revisions(&self.base_dir),
            None => Ok(Vec::new()),
        }
    }

    /// Revisions found in the export sidecars on disk. An aggregate scope
    /// reads the sidecar of every child folder.
    pub fn list_disk_revisions(&self) -> Result<Vec<Revision>> {
        let disk = self.backends.disk.as_ref();
        if !self.is_read_only() {
            return disk.list_revisions(&self.base_dir);
        }

        let mut revisions = disk.list_revisions(&self.base_dir)?;
        for child in disk.subfolders(&self.base_dir)? {
            let prefix = paths::join(&[&self.base_dir, &child])?;
            revisions = revision::merge(revisions, disk.list_revisions(&prefix)?);
        }
        Ok(revisions)
    }

    /// Remove soft-deleted database rows of a fully synced scope.
    /// Returns the number of rows removed.
    pub fn compact(&self) -> Result<usize> {
        let Some(db) = self.backends.db.as_deref() else {
            return Ok(0);
        };

        let pending = db.list_revisions(&self.base_dir)?.len();
        if pending > 0 {
            return Err(Error::unsynced(self.name(), pending));
        }

        db.compact_deleted(&self.base_dir)
    }

    /// Copy the database files of a folder onto disk. Returns the number of
    /// files written; zero without a database.
    pub fn pull_to_disk(&self, folder: &str) -> Result<usize> {
        self.ensure_writable()?;
        let Some(db) = self.backends.db.as_deref() else {
            return Ok(0);
        };
        let dir = self.folder_path(folder)?;

        let files = db.directory_listing(&dir, &ListingOptions::with_dot_files())?;
        for file in &files {
            let path = paths::join(&[&dir, file])?;
            let content = db.read_file(&path)?;
            self.backends.disk.upsert_file(&path, &content, false)?;
        }

        tracing::debug!(folder = %dir, files = files.len(), "pulled database files to disk");
        Ok(files.len())
    }
}
