//! # Ghost Core
//!
//! A revisioned file store with a disk backend and a database backend.
//!
//! Files are addressed by logical paths under `data/global` and
//! `data/bots/{botId}`. On disk they are a plain, human-editable tree. In DB
//! mode writes go to SQLite instead and every mutation records a revision;
//! a sync later replays disk content into the database, but only once every
//! database revision has made it back to disk through an export.
//!
//! ## Features
//!
//! - Interchangeable disk and SQLite storage drivers
//! - Scopes per bot, a global scope and a read-only aggregate over all bots
//! - Size-bounded read cache shared by every scope
//! - Whole-scope sync gated on pending revisions
//! - Directory and tar.gz export with a revision sidecar
//!
//! ## Example
//!
//! ```no_run
//! use ghost_core::{GhostConfig, GhostService, SyncOutcome};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = GhostConfig::new("./project");
//! config.db_path = Some("./project/ghost.db".into());
//! let service = GhostService::new(config)?;
//!
//! // Write through a bot scope; a revision is recorded in DB mode
//! let bot = service.for_bot("bot1")?;
//! bot.upsert_file("qna", "faq.json", r#"{"q":"hi"}"#)?;
//!
//! // Edits only in the database keep the sync from running
//! if let SyncOutcome::Blocked { unsynced } = bot.sync()? {
//!     println!("{} revision(s) still pending", unsynced);
//! }
//!
//! // Export everything, revisions included
//! let archive = service.export_archive(&["bot1"])?;
//! std::fs::write("./export.tgz", archive)?;
//! # Ok(())
//! # }
//! ```

mod cache;
mod config;
mod driver;
mod error;
mod export;
mod paths;
mod revision;
mod scoped;
mod service;
mod sync;

pub use cache::{CacheKind, Generation, ObjectCache, cache_key};
pub use config::{
    CONFIG_FILE, DEFAULT_CACHE_CAPACITY, DEFAULT_MAX_FILE_SIZE, DEFAULT_REVISION_AUTHOR,
    GhostConfig, parse_size,
};
pub use driver::{DbStorageDriver, DiskStorageDriver, IGNORE_MARKER, ListingOptions, StorageDriver};
pub use error::{Error, Result};
pub use paths::{normalize as normalize_path, validate_bot_id};
pub use revision::{PendingRevisions, REVISIONS_FILE, ROOT_BUCKET, Revision, new_revision_id};
pub use scoped::{FileContent, FileListener, ListenHandle, ScopedGhost, UpsertOptions};
pub use service::{BOT_CONFIG_FILE, BOTS_DIR, GLOBAL_DIR, GhostService, ServerWidePending};
pub use sync::{SyncOutcome, SyncStats};
