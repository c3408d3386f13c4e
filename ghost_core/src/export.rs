//! Exporting scopes to plain trees and archives, and importing them back.
//!
//! An exported scope is its file tree plus a `revisions.json` sidecar at the
//! root listing every revision known to disk or database. Once the tree is
//! copied back over the disk scope, that sidecar is what lets the next sync
//! recognize the database edits as mirrored.

use crate::driver::ListingOptions;
use crate::error::{Error, Result};
use crate::paths;
use crate::revision::{self, REVISIONS_FILE};
use crate::scoped::ScopedGhost;
use crate::service::GhostService;
use flate2::Compression;
use flate2::write::GzEncoder;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

impl ScopedGhost {
    /// Copy every file of the scope into `target` and write the merged
    /// revision sidecar. Returns the written paths relative to `target`,
    /// sidecar last.
    pub fn export_to_directory(&self, target: &Path, excludes: &[&str]) -> Result<Vec<String>> {
        let options = ListingOptions::with_dot_files().excluding(excludes.iter().copied());
        let primary = self.primary();

        let mut exported = Vec::new();
        for file in primary.directory_listing(&self.base_dir, &options)? {
            if self.is_sidecar(&file) {
                continue;
            }

            let content = primary.read_file(&paths::join(&[&self.base_dir, &file])?)?;
            let out = target.join(&file);
            if let Some(parent) = out.parent() {
                fs::create_dir_all(parent).map_err(|e| Error::io("create dir", parent, e))?;
            }
            fs::write(&out, content).map_err(|e| Error::io("export", &out, e))?;
            exported.push(file);
        }

        let revisions = revision::merge(self.list_disk_revisions()?, self.list_db_revisions()?);
        let sidecar = target.join(REVISIONS_FILE);
        let json = serde_json::to_vec_pretty(&revisions)
            .map_err(|e| Error::json(sidecar.display().to_string(), e))?;
        fs::create_dir_all(target).map_err(|e| Error::io("create dir", target, e))?;
        fs::write(&sidecar, json).map_err(|e| Error::io("export", &sidecar, e))?;
        exported.push(REVISIONS_FILE.to_string());

        tracing::debug!(
            scope = %self.name(),
            files = exported.len(),
            revisions = revisions.len(),
            "exported scope"
        );
        Ok(exported)
    }

    /// Export the scope as an in-memory gzip tarball.
    pub fn export_to_archive_buffer(&self, excludes: &[&str]) -> Result<Vec<u8>> {
        let staging = staging_dir()?;
        let files = self.export_to_directory(staging.path(), excludes)?;
        write_archive(staging.path(), &files)
    }

    /// Write every file of a plain tree into the scope, recording a revision
    /// for each. A sidecar at the tree root is skipped. Returns the number of
    /// files imported.
    pub fn import_from_directory(&self, dir: &Path) -> Result<usize> {
        let files = self.backends.disk.absolute_directory_listing(dir)?;

        let mut imported = 0;
        for file in files.iter().filter(|f| !self.is_sidecar(f)) {
            let source = dir.join(file);
            let content = fs::read(&source).map_err(|e| Error::io("import", &source, e))?;
            let name = file.rsplit('/').next().unwrap_or(file.as_str());
            self.upsert_file(paths::parent(file), name, content)?;
            imported += 1;
        }

        tracing::info!(scope = %self.name(), imported, "imported directory");
        Ok(imported)
    }
}

impl GhostService {
    /// Export the global scope and the given bots into one gzip tarball laid
    /// out as `global/...` and `bots/{id}/...`.
    pub fn export_archive(&self, bot_ids: &[&str]) -> Result<Vec<u8>> {
        let staging = staging_dir()?;
        let mut files = Vec::new();

        for file in self
            .global()
            .export_to_directory(&staging.path().join("global"), &[])?
        {
            files.push(format!("global/{file}"));
        }

        for id in bot_ids {
            let bot = self.for_bot(id)?;
            let prefix = format!("bots/{id}");
            for file in bot.export_to_directory(&staging.path().join(&prefix), &[])? {
                files.push(format!("{prefix}/{file}"));
            }
        }

        write_archive(staging.path(), &files)
    }
}

/// Temporary directory removed when dropped, whatever the outcome.
fn staging_dir() -> Result<TempDir> {
    TempDir::new().map_err(|e| Error::io("create staging dir", std::env::temp_dir(), e))
}

/// Tar and gzip `files` (relative to `root`) into a buffer.
fn write_archive(root: &Path, files: &[String]) -> Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);

    for file in files {
        let source = root.join(file);
        let content = fs::read(&source).map_err(|e| Error::io("archive", &source, e))?;

        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        builder
            .append_data(&mut header, file, content.as_slice())
            .map_err(|e| Error::io("archive", &source, e))?;
    }

    let encoder = builder
        .into_inner()
        .map_err(|e| Error::io("archive", root, e))?;
    encoder.finish().map_err(|e| Error::io("archive", root, e))
}
