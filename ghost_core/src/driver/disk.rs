//! Filesystem-backed storage driver.

use super::{ListingOptions, StorageDriver, apply_listing_options};
use crate::error::{Error, Result};
use crate::paths;
use crate::revision::{REVISIONS_FILE, Revision};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// A file with this name anywhere under a top-level folder keeps that folder
/// out of database tracking.
pub const IGNORE_MARKER: &str = ".ghostignore";

/// Stores files as a plain directory tree under one root.
///
/// This is the human-editable source of truth. It keeps no revision index at
/// runtime: `list_revisions` only reads the sidecar an export left behind.
#[derive(Debug, Clone)]
pub struct DiskStorageDriver {
    root: PathBuf,
}

impl DiskStorageDriver {
    /// Create a driver resolving logical paths against `root`.
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Get the root directory of the driver.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute location of a logical path.
    pub fn resolve(&self, path: &str) -> PathBuf {
        if path.is_empty() {
            self.root.clone()
        } else {
            self.root.join(path)
        }
    }

    /// Direct subfolders of `folder`, as sorted names. A missing folder
    /// yields an empty list.
    pub fn subfolders(&self, folder: &str) -> Result<Vec<String>> {
        let dir = self.resolve(folder);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::io("list", &dir, e)),
        };

        let mut folders = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::io("list", &dir, e))?;
            if !entry.path().is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                folders.push(name.to_string());
            }
        }

        folders.sort();
        Ok(folders)
    }

    /// Top-level folders of `folder` that do not contain the ignore marker.
    ///
    /// Returns folder names (not paths), sorted. A missing folder yields an
    /// empty list.
    pub fn discover_trackable_folders(&self, folder: &str) -> Result<Vec<String>> {
        let mut trackable = Vec::new();
        for name in self.subfolders(folder)? {
            let entry_path = self.resolve(folder).join(&name);
            if contains_marker(&entry_path)? {
                tracing::debug!(folder = %entry_path.display(), "folder opted out of tracking");
                continue;
            }
            trackable.push(name);
        }
        Ok(trackable)
    }

    /// List files of an arbitrary directory, outside the driver root.
    pub fn absolute_directory_listing(&self, dir: &Path) -> Result<Vec<String>> {
        walk_files(dir, &ListingOptions::with_dot_files())
    }

    /// Write a file atomically using tempfile.
    fn write_atomic(&self, target: &Path, content: &[u8]) -> Result<()> {
        // Create parent directory if needed
        let parent = match target.parent() {
            Some(parent) => parent.to_path_buf(),
            None => self.root.clone(),
        };
        fs::create_dir_all(&parent).map_err(|e| Error::io("create dir", &parent, e))?;

        let mut temp_file =
            tempfile::NamedTempFile::new_in(&parent).map_err(|e| Error::io("write", target, e))?;
        temp_file
            .write_all(content)
            .and_then(|_| temp_file.flush())
            .map_err(|e| Error::io("write", target, e))?;

        // Persist atomically
        temp_file
            .persist(target)
            .map_err(|e| Error::io("write", target, e.error))?;

        Ok(())
    }
}

impl StorageDriver for DiskStorageDriver {
    fn upsert_file(&self, path: &str, content: &[u8], _record_revision: bool) -> Result<()> {
        self.write_atomic(&self.resolve(path), content)
    }

    fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let full = self.resolve(path);
        fs::read(&full).map_err(|e| match e.kind() {
            ErrorKind::NotFound => Error::not_found(path),
            _ => Error::io("read", &full, e),
        })
    }

    fn file_exists(&self, path: &str) -> Result<bool> {
        Ok(self.resolve(path).is_file())
    }

    fn delete_file(&self, path: &str, _record_revision: bool) -> Result<()> {
        let full = self.resolve(path);
        match fs::remove_file(&full) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io("delete", &full, e)),
        }
    }

    fn delete_dir(&self, folder: &str) -> Result<()> {
        let full = self.resolve(folder);
        match fs::remove_dir_all(&full) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io("delete dir", &full, e)),
        }
    }

    fn move_file(&self, from: &str, to: &str) -> Result<()> {
        let source = self.resolve(from);
        let target = self.resolve(to);

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io("create dir", parent, e))?;
        }

        fs::rename(&source, &target).map_err(|e| match e.kind() {
            ErrorKind::NotFound if !source.exists() => Error::not_found(from),
            _ => Error::io("move", &source, e),
        })
    }

    fn directory_listing(&self, folder: &str, options: &ListingOptions) -> Result<Vec<String>> {
        walk_files(&self.resolve(folder), options)
    }

    fn list_revisions(&self, prefix: &str) -> Result<Vec<Revision>> {
        let sidecar = match paths::join(&[prefix, REVISIONS_FILE]) {
            Ok(logical) => self.resolve(&logical),
            Err(_) => return Ok(Vec::new()),
        };

        let content = match fs::read(&sidecar) {
            Ok(content) => content,
            Err(e) => {
                tracing::debug!(path = %sidecar.display(), error = %e, "no revision sidecar");
                return Ok(Vec::new());
            }
        };

        match serde_json::from_slice::<Vec<Revision>>(&content) {
            Ok(revisions) => Ok(revisions
                .into_iter()
                .filter(|r| paths::is_under(&r.path, prefix))
                .collect()),
            Err(e) => {
                tracing::warn!(
                    path = %sidecar.display(),
                    error = %e,
                    "unreadable revision sidecar, treating as empty"
                );
                Ok(Vec::new())
            }
        }
    }

    fn delete_revision(&self, _path: &str, _revision: &str) -> Result<()> {
        // Disk revisions only live in the export sidecar
        Ok(())
    }
}

/// Walk `dir` and return its files as sorted, slash-separated relative paths.
fn walk_files(dir: &Path, options: &ListingOptions) -> Result<Vec<String>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let walker = ignore::WalkBuilder::new(dir)
        .max_depth(if options.recursive { None } else { Some(1) })
        .hidden(!options.include_dot_files)
        .ignore(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .parents(false)
        .build();

    let mut files = Vec::new();
    for entry in walker {
        let entry = entry.map_err(|e| Error::walk(dir, e))?;
        if !entry.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }

        if let Ok(relative) = entry.path().strip_prefix(dir) {
            files.push(relative.to_string_lossy().replace('\\', "/"));
        }
    }

    Ok(apply_listing_options(files, options))
}

/// Whether the ignore marker exists anywhere beneath `dir`.
fn contains_marker(dir: &Path) -> Result<bool> {
    let walker = ignore::WalkBuilder::new(dir)
        .hidden(false)
        .ignore(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .parents(false)
        .build();

    for entry in walker {
        let entry = entry.map_err(|e| Error::walk(dir, e))?;
        let is_file = entry.file_type().is_some_and(|t| t.is_file());
        if is_file && entry.file_name() == std::ffi::OsStr::new(IGNORE_MARKER) {
            return Ok(true);
        }
    }

    Ok(false)
}
