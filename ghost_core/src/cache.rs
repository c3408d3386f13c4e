//! Read cache shared by every scope of a service.
//!
//! Entries are keyed by kind and logical path (`buffer::data/global/a.json`,
//! `object::data/global/a.json`) and bounded by their total size in bytes.
//! Writers invalidate before returning; readers snapshot a generation number
//! before hitting the driver and only insert when no invalidation happened in
//! between, so a slow read cannot put back content a write has replaced.

use crate::paths;
use moka::sync::Cache;
use parking_lot::Mutex;
use std::sync::Arc;

/// Kind of cached representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKind {
    /// Parsed JSON document.
    Object,
    /// Raw file bytes.
    Buffer,
}

impl CacheKind {
    fn prefix(self) -> &'static str {
        match self {
            CacheKind::Object => "object",
            CacheKind::Buffer => "buffer",
        }
    }
}

/// Render the cache key for a path.
pub fn cache_key(kind: CacheKind, path: &str) -> String {
    format!("{}::{}", kind.prefix(), path)
}

#[derive(Debug, Clone)]
enum Entry {
    Buffer(Arc<Vec<u8>>),
    Object {
        value: Arc<serde_json::Value>,
        size: usize,
    },
}

impl Entry {
    fn weight(&self) -> usize {
        match self {
            Entry::Buffer(bytes) => bytes.len(),
            Entry::Object { size, .. } => *size,
        }
    }
}

/// Snapshot taken before a driver read; see [`ObjectCache::generation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Generation(u64);

/// Size-bounded cache of file buffers and parsed JSON objects.
pub struct ObjectCache {
    entries: Cache<String, Entry>,
    generation: Mutex<u64>,
}

impl std::fmt::Debug for ObjectCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectCache")
            .field("entries", &self.entries.entry_count())
            .field("generation", &*self.generation.lock())
            .finish()
    }
}

impl ObjectCache {
    /// Create a cache holding at most `capacity` bytes of content.
    pub fn new(capacity: u64) -> Self {
        let entries = Cache::builder()
            .max_capacity(capacity)
            .weigher(|key: &String, entry: &Entry| {
                u32::try_from(key.len() + entry.weight()).unwrap_or(u32::MAX)
            })
            .build();

        Self {
            entries,
            generation: Mutex::new(0),
        }
    }

    /// Current generation. Take this before reading from a driver and pass it
    /// back to `insert_*`.
    pub fn generation(&self) -> Generation {
        Generation(*self.generation.lock())
    }

    pub fn get_buffer(&self, path: &str) -> Option<Arc<Vec<u8>>> {
        match self.entries.get(&cache_key(CacheKind::Buffer, path))? {
            Entry::Buffer(bytes) => Some(bytes),
            Entry::Object { .. } => None,
        }
    }

    pub fn get_object(&self, path: &str) -> Option<Arc<serde_json::Value>> {
        match self.entries.get(&cache_key(CacheKind::Object, path))? {
            Entry::Object { value, .. } => Some(value),
            Entry::Buffer(_) => None,
        }
    }

    /// Cache raw bytes unless the path was invalidated after `seen`.
    /// Returns whether the entry was stored.
    pub fn insert_buffer(&self, path: &str, seen: Generation, bytes: Arc<Vec<u8>>) -> bool {
        self.insert(CacheKind::Buffer, path, seen, Entry::Buffer(bytes))
    }

    /// Cache a parsed document unless the path was invalidated after `seen`.
    /// `size` is the length of the source bytes.
    pub fn insert_object(
        &self,
        path: &str,
        seen: Generation,
        value: Arc<serde_json::Value>,
        size: usize,
    ) -> bool {
        self.insert(CacheKind::Object, path, seen, Entry::Object { value, size })
    }

    fn insert(&self, kind: CacheKind, path: &str, seen: Generation, entry: Entry) -> bool {
        let current = self.generation.lock();
        if *current != seen.0 {
            tracing::debug!(path, "skipping cache fill after concurrent write");
            return false;
        }
        self.entries.insert(cache_key(kind, path), entry);
        true
    }

    /// Drop both representations of one path.
    pub fn invalidate(&self, path: &str) {
        let mut current = self.generation.lock();
        *current += 1;
        self.entries.invalidate(&cache_key(CacheKind::Buffer, path));
        self.entries.invalidate(&cache_key(CacheKind::Object, path));
    }

    /// Drop every entry whose path is `folder` or lies beneath it.
    pub fn invalidate_prefix(&self, folder: &str) {
        let mut current = self.generation.lock();
        *current += 1;

        let stale: Vec<Arc<String>> = self
            .entries
            .iter()
            .filter(|(key, _)| {
                key.split_once("::")
                    .is_some_and(|(_, path)| paths::is_under(path, folder))
            })
            .map(|(key, _)| key)
            .collect();

        for key in stale {
            self.entries.invalidate(key.as_str());
        }
    }

    /// Drop everything.
    pub fn clear(&self) {
        let mut current = self.generation.lock();
        *current += 1;
        self.entries.invalidate_all();
    }

    /// Approximate number of cached entries.
    pub fn entry_count(&self) -> u64 {
        self.entries.run_pending_tasks();
        self.entries.entry_count()
    }
}
