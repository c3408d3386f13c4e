//! Scoped access to the file store.
//!
//! A [`ScopedGhost`] addresses files by `(folder, file)` relative to a base
//! directory such as `data/global` or `data/bots/bot1`. Writes go to the
//! primary driver (the database in DB mode, the disk otherwise) and
//! invalidate the shared cache before returning. Reads go through the cache.
//!
//! A base ending in `*` (like `data/bots/*`) is an aggregate over every
//! child folder: it can be read, listed and synced but never written.
//! Single-file reads through an aggregate are allowed too, with the folder
//! given as `{child}/{folder}` (for example `bot1/qna`).

use crate::cache::ObjectCache;
use crate::driver::{
    DbStorageDriver, DiskStorageDriver, GLOB_OPTIONS, ListingOptions, StorageDriver,
};
use crate::error::{Error, Result};
use crate::paths;
use crate::revision::REVISIONS_FILE;
use glob::Pattern;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Callback run with the logical path of every changed file.
pub type FileListener = Arc<dyn Fn(&str) + Send + Sync>;

type Listeners = Mutex<Vec<(u64, FileListener)>>;

/// Drivers and settings shared by every scope of a service.
#[derive(Clone)]
pub(crate) struct Backends {
    pub(crate) disk: Arc<DiskStorageDriver>,
    pub(crate) db: Option<Arc<DbStorageDriver>>,
    pub(crate) cache: Arc<ObjectCache>,
    pub(crate) max_file_size: usize,
}

/// Options for [`ScopedGhost::upsert_file_with`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOptions {
    /// Append a revision for this write (DB mode only).
    pub record_revision: bool,
}

impl Default for UpsertOptions {
    fn default() -> Self {
        Self {
            record_revision: true,
        }
    }
}

/// One file of a batch write, addressed relative to the batch folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileContent {
    pub path: String,
    pub content: Vec<u8>,
}

impl FileContent {
    pub fn new(path: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }
}

/// Registration returned by [`ScopedGhost::on_file_changed`].
pub struct ListenHandle {
    id: u64,
    listeners: Weak<Listeners>,
}

impl ListenHandle {
    /// Stop receiving change notifications.
    pub fn remove(self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.lock().retain(|(id, _)| *id != self.id);
        }
    }
}

/// File access bound to one base directory.
pub struct ScopedGhost {
    name: String,
    pub(crate) base_dir: String,
    read_only: bool,
    pub(crate) backends: Backends,
    listeners: Arc<Listeners>,
    next_listener: AtomicU64,
}

impl std::fmt::Debug for ScopedGhost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedGhost")
            .field("name", &self.name)
            .field("base_dir", &self.base_dir)
            .field("read_only", &self.read_only)
            .field("db_mode", &self.backends.db.is_some())
            .finish()
    }
}

impl ScopedGhost {
    /// Open a scope on `base_dir`. A `*` is only accepted as the very last
    /// character and makes the scope read-only.
    pub(crate) fn new(base_dir: &str, backends: Backends) -> Result<Self> {
        let (stem, read_only) = match base_dir.find('*') {
            None => (base_dir, false),
            Some(pos) if pos == base_dir.len() - 1 => (&base_dir[..pos], true),
            Some(_) => {
                return Err(Error::invalid_scope(
                    base_dir,
                    "a wildcard is only allowed as the last character",
                ));
            }
        };

        let normalized = paths::normalize(stem)?;
        if normalized.is_empty() {
            return Err(Error::invalid_scope(base_dir, "base directory cannot be empty"));
        }

        Ok(Self {
            name: base_dir.to_string(),
            base_dir: normalized,
            read_only,
            backends,
            listeners: Arc::new(Mutex::new(Vec::new())),
            next_listener: AtomicU64::new(0),
        })
    }

    /// Base directory as given when the scope was opened.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Normalized base directory, wildcard removed.
    pub fn base_dir(&self) -> &str {
        &self.base_dir
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Whether the database driver is primary for this scope.
    pub fn is_db_backed(&self) -> bool {
        self.backends.db.is_some()
    }

    pub(crate) fn primary(&self) -> &dyn StorageDriver {
        match &self.backends.db {
            Some(db) => db.as_ref(),
            None => self.backends.disk.as_ref(),
        }
    }

    pub(crate) fn cache(&self) -> &ObjectCache {
        &self.backends.cache
    }

    pub(crate) fn ensure_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(Error::read_only_scope(&self.name));
        }
        Ok(())
    }

    /// Whether a scope-relative path is an export sidecar: `revisions.json`
    /// at the scope root, or at the root of each child of an aggregate scope.
    pub(crate) fn is_sidecar(&self, relative: &str) -> bool {
        match relative.rsplit_once('/') {
            None => relative == REVISIONS_FILE,
            Some((parent, name)) => {
                name == REVISIONS_FILE && self.read_only && !parent.contains('/')
            }
        }
    }

    /// Logical path of a folder inside the scope.
    pub(crate) fn folder_path(&self, folder: &str) -> Result<String> {
        let path = paths::join(&[&self.base_dir, folder])?;
        if !paths::is_under(&path, &self.base_dir) {
            return Err(Error::invalid_path(folder, "escapes the scope"));
        }
        Ok(path)
    }

    /// Logical path of a file inside the scope.
    pub(crate) fn file_path(&self, folder: &str, file: &str) -> Result<String> {
        let path = paths::join(&[&self.base_dir, folder, file])?;
        if path == self.base_dir || !paths::is_under(&path, &self.base_dir) {
            return Err(Error::invalid_path(file, "escapes the scope"));
        }
        Ok(path)
    }

    /// Write a file and record a revision for it.
    pub fn upsert_file(&self, folder: &str, file: &str, content: impl AsRef<[u8]>) -> Result<()> {
        self.upsert_file_with(folder, file, content, UpsertOptions::default())
    }

    pub fn upsert_file_with(
        &self,
        folder: &str,
        file: &str,
        content: impl AsRef<[u8]>,
        options: UpsertOptions,
    ) -> Result<()> {
        self.ensure_writable()?;
        let content = content.as_ref();
        let path = self.file_path(folder, file)?;

        let limit = self.backends.max_file_size;
        if content.len() > limit {
            return Err(Error::file_too_large(path, content.len(), limit));
        }

        self.primary()
            .upsert_file(&path, content, options.record_revision)?;
        self.cache().invalidate(&path);
        self.notify(&path);
        Ok(())
    }

    /// Write several files under one folder. Stops at the first failure;
    /// files written before it stay written.
    pub fn upsert_files(&self, folder: &str, files: &[FileContent]) -> Result<()> {
        for file in files {
            self.upsert_file(folder, &file.path, &file.content)?;
        }
        Ok(())
    }

    pub fn read_file_as_buffer(&self, folder: &str, file: &str) -> Result<Vec<u8>> {
        let path = self.file_path(folder, file)?;
        Ok(self.read_buffer(&path)?.as_ref().clone())
    }

    pub fn read_file_as_string(&self, folder: &str, file: &str) -> Result<String> {
        let path = self.file_path(folder, file)?;
        let bytes = self.read_buffer(&path)?.as_ref().clone();
        String::from_utf8(bytes).map_err(|e| Error::utf8(path, e))
    }

    /// Read and parse a JSON file.
    pub fn read_file_as_value(&self, folder: &str, file: &str) -> Result<serde_json::Value> {
        let path = self.file_path(folder, file)?;
        Ok(self.read_object(&path)?.as_ref().clone())
    }

    /// Read a JSON file into `T`.
    pub fn read_file_as_object<T: DeserializeOwned>(&self, folder: &str, file: &str) -> Result<T> {
        let path = self.file_path(folder, file)?;
        let value = self.read_object(&path)?;
        serde_json::from_value(value.as_ref().clone()).map_err(|e| Error::json(path, e))
    }

    fn read_buffer(&self, path: &str) -> Result<Arc<Vec<u8>>> {
        let cache = self.cache();
        if let Some(bytes) = cache.get_buffer(path) {
            return Ok(bytes);
        }

        let seen = cache.generation();
        let bytes = Arc::new(self.primary().read_file(path)?);
        cache.insert_buffer(path, seen, Arc::clone(&bytes));
        Ok(bytes)
    }

    fn read_object(&self, path: &str) -> Result<Arc<serde_json::Value>> {
        let cache = self.cache();
        if let Some(value) = cache.get_object(path) {
            return Ok(value);
        }

        let seen = cache.generation();
        let bytes = self.read_buffer(path)?;
        let value: serde_json::Value =
            serde_json::from_slice(&bytes).map_err(|e| Error::json(path, e))?;
        let value = Arc::new(value);
        cache.insert_object(path, seen, Arc::clone(&value), bytes.len());
        Ok(value)
    }

    pub fn file_exists(&self, folder: &str, file: &str) -> Result<bool> {
        let path = self.file_path(folder, file)?;
        self.primary().file_exists(&path)
    }

    pub fn delete_file(&self, folder: &str, file: &str) -> Result<()> {
        self.ensure_writable()?;
        let path = self.file_path(folder, file)?;

        self.primary().delete_file(&path, true)?;
        self.cache().invalidate(&path);
        self.notify(&path);
        Ok(())
    }

    /// Delete every file under a folder of the scope.
    pub fn delete_folder(&self, folder: &str) -> Result<()> {
        self.ensure_writable()?;
        let path = self.folder_path(folder)?;
        if path == self.base_dir {
            return Err(Error::invalid_path(folder, "cannot delete the scope root"));
        }

        self.primary().delete_dir(&path)?;
        self.cache().invalidate_prefix(&path);
        self.notify(&path);
        Ok(())
    }

    pub fn rename_file(&self, folder: &str, from: &str, to: &str) -> Result<()> {
        self.ensure_writable()?;
        let source = self.file_path(folder, from)?;
        let target = self.file_path(folder, to)?;

        self.primary().move_file(&source, &target)?;
        self.cache().invalidate(&source);
        self.cache().invalidate(&target);
        self.notify(&source);
        self.notify(&target);
        Ok(())
    }

    /// List files under a folder of the scope.
    ///
    /// `pattern` is a case-insensitive glob. Without a `/` it matches the
    /// file name only; with one it matches the folder-relative path. `None`
    /// lists everything.
    pub fn directory_listing(
        &self,
        folder: &str,
        pattern: Option<&str>,
        excludes: &[&str],
    ) -> Result<Vec<String>> {
        let options = ListingOptions::default().excluding(excludes.iter().copied());
        self.directory_listing_with(folder, pattern, &options)
    }

    pub fn directory_listing_with(
        &self,
        folder: &str,
        pattern: Option<&str>,
        options: &ListingOptions,
    ) -> Result<Vec<String>> {
        let dir = self.folder_path(folder)?;
        let files = self.primary().directory_listing(&dir, options)?;

        let Some(pattern) = pattern else {
            return Ok(files);
        };
        let matcher = Pattern::new(pattern)
            .map_err(|e| Error::invalid_path(pattern, format!("malformed glob: {e}")))?;
        let match_base = !pattern.contains('/');

        Ok(files
            .into_iter()
            .filter(|relative| {
                let candidate = if match_base {
                    relative.rsplit('/').next().unwrap_or(relative.as_str())
                } else {
                    relative.as_str()
                };
                matcher.matches_with(candidate, GLOB_OPTIONS)
            })
            .collect())
    }

    /// Drop one file from the cache without touching storage.
    pub fn invalidate_file(&self, folder: &str, file: &str) -> Result<()> {
        let path = self.file_path(folder, file)?;
        self.cache().invalidate(&path);
        Ok(())
    }

    /// Register a callback run after every successful write, delete or
    /// rename made through this scope.
    pub fn on_file_changed<F>(&self, listener: F) -> ListenHandle
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push((id, Arc::new(listener)));
        ListenHandle {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    pub(crate) fn clear_listeners(&self) {
        self.listeners.lock().clear();
    }

    fn notify(&self, path: &str) {
        // Callbacks run outside the lock so they may register or remove listeners
        let listeners: Vec<FileListener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in listeners {
            listener(path);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::DEFAULT_CACHE_CAPACITY;
    use serde::Deserialize;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    pub(crate) fn backends(temp: &TempDir, db_mode: bool) -> Backends {
        Backends {
            disk: Arc::new(DiskStorageDriver::new(temp.path())),
            db: db_mode.then(|| Arc::new(DbStorageDriver::open_in_memory().unwrap())),
            cache: Arc::new(ObjectCache::new(DEFAULT_CACHE_CAPACITY)),
            max_file_size: 1024,
        }
    }

    fn scope(temp: &TempDir, base: &str, db_mode: bool) -> ScopedGhost {
        ScopedGhost::new(base, backends(temp, db_mode)).unwrap()
    }

    #[test]
    fn test_wildcard_position() {
        let temp = TempDir::new().unwrap();
        assert!(ScopedGhost::new("data/bots/*", backends(&temp, false)).is_ok());

        let err = ScopedGhost::new("data/*/bots", backends(&temp, false)).unwrap_err();
        assert!(matches!(err, Error::InvalidScope { .. }));
        assert!(ScopedGhost::new("*/x", backends(&temp, false)).is_err());
        assert!(ScopedGhost::new("", backends(&temp, false)).is_err());
    }

    #[test]
    fn test_wildcard_scope_rejects_writes() {
        for db_mode in [false, true] {
            let temp = TempDir::new().unwrap();
            let backends = backends(&temp, db_mode);
            let bots = ScopedGhost::new("data/bots/*", backends.clone()).unwrap();
            let bot = ScopedGhost::new("data/bots/bot1", backends).unwrap();
            bot.upsert_file("qna", "a.json", "{}").unwrap();

            assert!(matches!(
                bots.upsert_file("bot1/qna", "b.json", "{}").unwrap_err(),
                Error::ReadOnlyScope { .. }
            ));
            assert!(bots.delete_file("bot1/qna", "a.json").is_err());
            assert!(bots.delete_folder("bot1").is_err());
            assert!(bots.rename_file("bot1/qna", "a.json", "c.json").is_err());

            // Nothing changed
            assert_eq!(bot.directory_listing("qna", None, &[]).unwrap(), vec!["a.json"]);
            // Reads through the aggregate still work
            assert_eq!(bots.read_file_as_string("bot1/qna", "a.json").unwrap(), "{}");
        }
    }

    #[test]
    fn test_round_trip_both_modes() {
        for db_mode in [false, true] {
            let temp = TempDir::new().unwrap();
            let global = scope(&temp, "data/global", db_mode);

            global.upsert_file("config", "a.json", b"{\"n\":1}").unwrap();
            assert_eq!(global.read_file_as_buffer("config", "a.json").unwrap(), b"{\"n\":1}");
            assert!(global.file_exists("config", "a.json").unwrap());

            global.delete_file("config", "a.json").unwrap();
            assert!(global.read_file_as_buffer("config", "a.json").unwrap_err().is_not_found());
            assert!(!global.file_exists("config", "a.json").unwrap());
        }
    }

    #[test]
    fn test_db_mode_writes_skip_disk() {
        let temp = TempDir::new().unwrap();
        let global = scope(&temp, "data/global", true);
        global.upsert_file("", "a.json", "{}").unwrap();

        assert!(!temp.path().join("data/global/a.json").exists());
    }

    #[test]
    fn test_cache_coherence_after_overwrite() {
        for db_mode in [false, true] {
            let temp = TempDir::new().unwrap();
            let global = scope(&temp, "data/global", db_mode);

            global.upsert_file("", "a.json", "{\"v\":1}").unwrap();
            assert_eq!(global.read_file_as_value("", "a.json").unwrap()["v"], 1);
            assert_eq!(global.read_file_as_string("", "a.json").unwrap(), "{\"v\":1}");

            global.upsert_file("", "a.json", "{\"v\":2}").unwrap();
            assert_eq!(global.read_file_as_value("", "a.json").unwrap()["v"], 2);
            assert_eq!(global.read_file_as_string("", "a.json").unwrap(), "{\"v\":2}");
        }
    }

    #[test]
    fn test_read_file_as_object() {
        #[derive(Deserialize)]
        struct Faq {
            question: String,
        }

        let temp = TempDir::new().unwrap();
        let bot = scope(&temp, "data/bots/bot1", false);
        bot.upsert_file("qna", "faq.json", r#"{"question":"hi"}"#).unwrap();

        let faq: Faq = bot.read_file_as_object("qna", "faq.json").unwrap();
        assert_eq!(faq.question, "hi");

        bot.upsert_file("qna", "bad.json", "not json").unwrap();
        assert!(matches!(
            bot.read_file_as_value("qna", "bad.json").unwrap_err(),
            Error::Json { .. }
        ));
    }

    #[test]
    fn test_file_size_limit() {
        let temp = TempDir::new().unwrap();
        let global = scope(&temp, "data/global", false);

        let err = global.upsert_file("", "big.bin", vec![0u8; 2048]).unwrap_err();
        assert!(matches!(err, Error::FileTooLarge { size: 2048, limit: 1024, .. }));
    }

    #[test]
    fn test_paths_cannot_escape_scope() {
        let temp = TempDir::new().unwrap();
        let bot = scope(&temp, "data/bots/bot1", false);

        assert!(bot.upsert_file("../bot2", "a.json", "{}").is_err());
        assert!(bot.read_file_as_buffer("", "../../global/x").is_err());
        assert!(bot.delete_folder("").is_err());
    }

    #[test]
    fn test_directory_listing_patterns() {
        let temp = TempDir::new().unwrap();
        let bot = scope(&temp, "data/bots/bot1", false);
        bot.upsert_file("flows", "main.flow.json", "{}").unwrap();
        bot.upsert_file("flows/sub", "other.flow.json", "{}").unwrap();
        bot.upsert_file("flows", "main.ui.json", "{}").unwrap();
        bot.upsert_file("flows/node_modules/x", "skip.flow.json", "{}").unwrap();

        let all = bot.directory_listing("flows", None, &[]).unwrap();
        assert_eq!(all.len(), 4);

        let flows = bot
            .directory_listing("flows", Some("*.FLOW.json"), &["node_modules/**"])
            .unwrap();
        assert_eq!(flows, vec!["main.flow.json", "sub/other.flow.json"]);

        let nested = bot.directory_listing("flows", Some("sub/*.json"), &[]).unwrap();
        assert_eq!(nested, vec!["sub/other.flow.json"]);
    }

    #[test]
    fn test_upsert_files_and_rename() {
        let temp = TempDir::new().unwrap();
        let bot = scope(&temp, "data/bots/bot1", true);
        bot.upsert_files(
            "intents",
            &[FileContent::new("a.json", "{}"), FileContent::new("b.json", "[]")],
        )
        .unwrap();

        bot.rename_file("intents", "a.json", "c.json").unwrap();
        assert_eq!(
            bot.directory_listing("intents", None, &[]).unwrap(),
            vec!["b.json", "c.json"]
        );
    }

    #[test]
    fn test_rename_onto_itself_keeps_file() {
        for db_mode in [false, true] {
            let temp = TempDir::new().unwrap();
            let bot = scope(&temp, "data/bots/bot1", db_mode);
            bot.upsert_file("qna", "a.json", "{}").unwrap();

            bot.rename_file("qna", "a.json", "a.json").unwrap();
            assert_eq!(bot.read_file_as_string("qna", "a.json").unwrap(), "{}");
            assert_eq!(bot.directory_listing("qna", None, &[]).unwrap(), vec!["a.json"]);
        }
    }

    #[test]
    fn test_delete_folder_invalidates_cache() {
        let temp = TempDir::new().unwrap();
        let bot = scope(&temp, "data/bots/bot1", true);
        bot.upsert_file("qna", "a.json", "{}").unwrap();
        bot.read_file_as_buffer("qna", "a.json").unwrap();

        bot.delete_folder("qna").unwrap();
        assert!(bot.read_file_as_buffer("qna", "a.json").unwrap_err().is_not_found());
    }

    #[test]
    fn test_file_listeners() {
        let temp = TempDir::new().unwrap();
        let global = scope(&temp, "data/global", false);
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let handle = {
            let calls = Arc::clone(&calls);
            let seen = Arc::clone(&seen);
            global.on_file_changed(move |path| {
                calls.fetch_add(1, Ordering::SeqCst);
                seen.lock().push(path.to_string());
            })
        };

        global.upsert_file("x", "a.json", "{}").unwrap();
        global.delete_file("x", "a.json").unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(seen.lock()[0], "data/global/x/a.json");

        handle.remove();
        global.upsert_file("x", "b.json", "{}").unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
