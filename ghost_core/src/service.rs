//! Service factory handing out scopes.

use crate::cache::ObjectCache;
use crate::config::GhostConfig;
use crate::driver::{DbStorageDriver, DiskStorageDriver, ListingOptions, StorageDriver};
use crate::error::Result;
use crate::paths;
use crate::revision::PendingRevisions;
use crate::scoped::{Backends, ScopedGhost};
use crate::sync::SyncOutcome;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Base directory of the global scope.
pub const GLOBAL_DIR: &str = "data/global";

/// Parent directory of every bot scope.
pub const BOTS_DIR: &str = "data/bots";

/// File marking a folder under [`BOTS_DIR`] as a bot.
pub const BOT_CONFIG_FILE: &str = "bot.config.json";

/// Pending revisions across the whole server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServerWidePending {
    pub global: PendingRevisions,
    /// One entry per requested bot, in request order.
    pub bots: Vec<PendingRevisions>,
}

/// Owns the drivers, the shared cache and the per-bot scope registry.
pub struct GhostService {
    config: GhostConfig,
    backends: Backends,
    global: Arc<ScopedGhost>,
    bots: Arc<ScopedGhost>,
    registry: Mutex<HashMap<String, Arc<ScopedGhost>>>,
}

impl std::fmt::Debug for GhostService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GhostService")
            .field("root", &self.config.root)
            .field("db_mode", &self.is_db_mode())
            .field("bots", &self.registry.lock().len())
            .finish()
    }
}

impl GhostService {
    /// Open the drivers described by `config`.
    pub fn new(config: GhostConfig) -> Result<Self> {
        let disk = DiskStorageDriver::new(&config.root);
        let db = match &config.db_path {
            Some(path) => Some(DbStorageDriver::open(path)?),
            None => None,
        };
        Self::with_drivers(config, disk, db)
    }

    /// Build a service over existing drivers. DB mode is on when `db` is set.
    /// New revisions are attributed to `config.revision_author`.
    pub fn with_drivers(
        config: GhostConfig,
        disk: DiskStorageDriver,
        db: Option<DbStorageDriver>,
    ) -> Result<Self> {
        let author = config.revision_author.as_str();
        let backends = Backends {
            disk: Arc::new(disk),
            db: db.map(|db| Arc::new(db.with_author(author))),
            cache: Arc::new(ObjectCache::new(config.cache_capacity)),
            max_file_size: config.max_file_size,
        };

        let global = Arc::new(ScopedGhost::new(GLOBAL_DIR, backends.clone())?);
        let bots = Arc::new(ScopedGhost::new(&format!("{BOTS_DIR}/*"), backends.clone())?);

        tracing::debug!(
            root = %config.root.display(),
            db_mode = backends.db.is_some(),
            "ghost service ready"
        );

        Ok(Self {
            config,
            backends,
            global,
            bots,
            registry: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &GhostConfig {
        &self.config
    }

    /// Whether the database is the primary driver.
    pub fn is_db_mode(&self) -> bool {
        self.backends.db.is_some()
    }

    pub fn global(&self) -> Arc<ScopedGhost> {
        Arc::clone(&self.global)
    }

    /// Read-only aggregate over every bot.
    pub fn bots(&self) -> Arc<ScopedGhost> {
        Arc::clone(&self.bots)
    }

    /// Scope of one bot. The same instance is returned until the bot is
    /// evicted.
    pub fn for_bot(&self, bot_id: &str) -> Result<Arc<ScopedGhost>> {
        paths::validate_bot_id(bot_id)?;

        let mut registry = self.registry.lock();
        if let Some(scope) = registry.get(bot_id) {
            return Ok(Arc::clone(scope));
        }

        let scope = Arc::new(ScopedGhost::new(
            &format!("{BOTS_DIR}/{bot_id}"),
            self.backends.clone(),
        )?);
        registry.insert(bot_id.to_string(), Arc::clone(&scope));
        Ok(scope)
    }

    /// Open a scope on an arbitrary base directory. Not memoized.
    pub fn scope(&self, base_dir: &str) -> Result<ScopedGhost> {
        ScopedGhost::new(base_dir, self.backends.clone())
    }

    /// Forget a bot's scope and its listeners, and drop its cached files.
    /// Returns whether the bot had a scope.
    pub fn evict_bot(&self, bot_id: &str) -> bool {
        let Some(scope) = self.registry.lock().remove(bot_id) else {
            return false;
        };

        scope.clear_listeners();
        self.backends.cache.invalidate_prefix(scope.base_dir());
        tracing::debug!(bot_id, "evicted bot scope");
        true
    }

    /// Ids of every bot, found through their `bot.config.json`.
    pub fn bot_ids(&self) -> Result<Vec<String>> {
        let primary: &dyn StorageDriver = match &self.backends.db {
            Some(db) => db.as_ref(),
            None => self.backends.disk.as_ref(),
        };

        let files = primary.directory_listing(BOTS_DIR, &ListingOptions::default())?;
        Ok(files
            .iter()
            .filter_map(|file| file.split_once('/'))
            .filter(|(_, rest)| *rest == BOT_CONFIG_FILE)
            .map(|(id, _)| id.to_string())
            .collect())
    }

    /// Seed an empty database from disk: syncs the global scope, then every
    /// bot. Does nothing outside DB mode or when the database already holds
    /// global files.
    pub fn bootstrap(&self) -> Result<()> {
        let Some(db) = self.backends.db.as_deref() else {
            return Ok(());
        };
        if !db
            .directory_listing(GLOBAL_DIR, &ListingOptions::with_dot_files())?
            .is_empty()
        {
            return Ok(());
        }

        tracing::info!("database is empty, syncing from disk");
        for scope in [&self.global, &self.bots] {
            if let SyncOutcome::Blocked { unsynced } = scope.sync()? {
                tracing::warn!(scope = %scope.name(), unsynced, "bootstrap sync blocked");
            }
        }
        Ok(())
    }

    /// Pending revisions of the global scope and the given bots. `None`
    /// outside DB mode.
    pub fn get_pending(&self, bot_ids: &[&str]) -> Result<Option<ServerWidePending>> {
        if !self.is_db_mode() {
            return Ok(None);
        }

        let global = self.global.get_pending_changes()?;
        let mut bots = Vec::with_capacity(bot_ids.len());
        for id in bot_ids {
            bots.push(self.for_bot(id)?.get_pending_changes()?);
        }

        Ok(Some(ServerWidePending { global, bots }))
    }
}
