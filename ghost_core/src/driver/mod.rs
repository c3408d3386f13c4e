//! Storage drivers.
//!
//! A [`StorageDriver`] stores whole files under logical paths. Two
//! implementations exist: [`DiskStorageDriver`] writes a plain directory tree
//! and [`DbStorageDriver`] keeps files and a revision index in SQLite. They
//! are interchangeable at this boundary; callers above it never ask which one
//! they hold.

mod db;
mod disk;

pub use db::DbStorageDriver;
pub use disk::{DiskStorageDriver, IGNORE_MARKER};

use crate::error::Result;
use crate::revision::Revision;
use glob::{MatchOptions, Pattern};

/// Options for [`StorageDriver::directory_listing`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingOptions {
    /// Glob patterns matched against folder-relative paths; matches are dropped.
    pub excludes: Vec<String>,
    /// Include files and folders whose name starts with a dot.
    pub include_dot_files: bool,
    /// Descend into subfolders.
    pub recursive: bool,
}

impl Default for ListingOptions {
    fn default() -> Self {
        Self {
            excludes: Vec::new(),
            include_dot_files: false,
            recursive: true,
        }
    }
}

impl ListingOptions {
    /// Listing that also returns dotfiles.
    pub fn with_dot_files() -> Self {
        Self {
            include_dot_files: true,
            ..Self::default()
        }
    }

    /// Add exclusion patterns.
    pub fn excluding<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excludes.extend(patterns.into_iter().map(Into::into));
        self
    }

    /// Restrict the listing to the folder's direct children.
    pub fn top_level(mut self) -> Self {
        self.recursive = false;
        self
    }
}

/// Whole-file storage addressed by logical paths.
pub trait StorageDriver: Send + Sync {
    /// Create or replace a file. When `record_revision` is set the driver
    /// appends one revision for this mutation, if it tracks revisions.
    fn upsert_file(&self, path: &str, content: &[u8], record_revision: bool) -> Result<()>;

    /// Read a whole file. Fails with `NotFound` when absent.
    fn read_file(&self, path: &str) -> Result<Vec<u8>>;

    /// Whether a (non-deleted) file exists at `path`.
    fn file_exists(&self, path: &str) -> Result<bool>;

    /// Delete a file. Deleting an absent file succeeds.
    fn delete_file(&self, path: &str, record_revision: bool) -> Result<()>;

    /// Delete every file under `folder`.
    fn delete_dir(&self, folder: &str) -> Result<()>;

    /// Move a file to a new path, replacing any file already there.
    fn move_file(&self, from: &str, to: &str) -> Result<()>;

    /// List files under `folder` as sorted folder-relative paths.
    /// A folder that does not exist lists as empty.
    fn directory_listing(&self, folder: &str, options: &ListingOptions) -> Result<Vec<String>>;

    /// Revisions recorded for paths under `prefix`.
    fn list_revisions(&self, prefix: &str) -> Result<Vec<Revision>>;

    /// Forget one revision once it is known to be synced.
    fn delete_revision(&self, path: &str, revision: &str) -> Result<()>;
}

/// Options shared by every glob match in the crate: case-insensitive, `*`
/// never crosses a `/`, leading dots need not be literal.
pub(crate) const GLOB_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Compile glob patterns, skipping (and logging) malformed ones.
pub(crate) fn compile_patterns(patterns: &[String]) -> Vec<Pattern> {
    patterns
        .iter()
        .filter_map(|p| match Pattern::new(p) {
            Ok(pattern) => Some(pattern),
            Err(err) => {
                tracing::warn!(pattern = %p, error = %err, "ignoring malformed glob pattern");
                None
            }
        })
        .collect()
}

/// Whether any segment of a relative path starts with a dot.
pub(crate) fn is_dot_path(relative: &str) -> bool {
    relative.split('/').any(|segment| segment.starts_with('.'))
}

/// Apply listing options to folder-relative paths and sort the result.
///
/// Both drivers run their raw listings through this so that exclusion,
/// dotfile and depth rules behave identically.
pub(crate) fn apply_listing_options(paths: Vec<String>, options: &ListingOptions) -> Vec<String> {
    let excludes = compile_patterns(&options.excludes);

    let mut kept: Vec<String> = paths
        .into_iter()
        .filter(|p| options.recursive || !p.contains('/'))
        .filter(|p| options.include_dot_files || !is_dot_path(p))
        .filter(|p| !excludes.iter().any(|e| e.matches_with(p, GLOB_OPTIONS)))
        .collect();

    kept.sort();
    kept.dedup();
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing() -> Vec<String> {
        [
            "a.json",
            "nested/b.json",
            "nested/deep/c.js",
            ".hidden",
            "node_modules/pkg/index.js",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    #[test]
    fn test_default_options_skip_dotfiles() {
        let result = apply_listing_options(listing(), &ListingOptions::default());
        assert!(!result.contains(&".hidden".to_string()));
        assert_eq!(result.len(), 4);
    }

    #[test]
    fn test_top_level_only() {
        let options = ListingOptions::with_dot_files().top_level();
        let result = apply_listing_options(listing(), &options);
        assert_eq!(result, vec![".hidden".to_string(), "a.json".to_string()]);
    }

    #[test]
    fn test_excludes() {
        let options = ListingOptions::default().excluding(["**/node_modules/**", "*.json"]);
        let result = apply_listing_options(listing(), &options);
        assert_eq!(
            result,
            vec!["nested/b.json".to_string(), "nested/deep/c.js".to_string()]
        );
    }

    #[test]
    fn test_is_dot_path() {
        assert!(is_dot_path(".ghostignore"));
        assert!(is_dot_path("a/.git/config"));
        assert!(!is_dot_path("a/b.json"));
    }
}
