//! Service configuration.

use crate::error::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Name of the optional config file under the project root.
pub const CONFIG_FILE: &str = "ghost.conf";

/// Default maximum size of a single file (100 MiB).
pub const DEFAULT_MAX_FILE_SIZE: usize = 100 * 1024 * 1024;

/// Default object cache budget (64 MiB).
pub const DEFAULT_CACHE_CAPACITY: u64 = 64 * 1024 * 1024;

/// Default author recorded on revisions.
pub const DEFAULT_REVISION_AUTHOR: &str = "admin";

/// Configuration for a [`GhostService`](crate::GhostService).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GhostConfig {
    /// Project directory containing `data/`.
    pub root: PathBuf,
    /// SQLite database file. DB mode is enabled when set.
    pub db_path: Option<PathBuf>,
    /// Object cache budget in bytes.
    pub cache_capacity: u64,
    /// Largest accepted file, in bytes.
    pub max_file_size: usize,
    /// Author recorded on every revision.
    pub revision_author: String,
}

impl Default for GhostConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            db_path: None,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            revision_author: DEFAULT_REVISION_AUTHOR.to_string(),
        }
    }
}

impl GhostConfig {
    /// Config rooted at `root` with defaults everywhere else.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Whether the database driver is the primary driver.
    pub fn db_mode(&self) -> bool {
        self.db_path.is_some()
    }

    /// Load `ghost.conf` from the project root, falling back to defaults
    /// when the file does not exist.
    pub fn load<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref();
        let config_path = root.join(CONFIG_FILE);

        let mut config = Self::new(root);
        if !config_path.exists() {
            return Ok(config);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|e| Error::io("read config", &config_path, e))?;
        config.apply(&content)?;

        // Relative database paths are resolved against the project root
        if let Some(db_path) = config.db_path.take() {
            config.db_path = Some(if db_path.is_relative() {
                root.join(db_path)
            } else {
                db_path
            });
        }

        Ok(config)
    }

    /// Parse a `key=value` config document on top of the defaults.
    pub fn parse(content: &str) -> Result<Self> {
        let mut config = Self::default();
        config.apply(content)?;
        Ok(config)
    }

    /// Apply `key=value` lines. Blank lines and `#` comments are skipped,
    /// unknown keys are ignored.
    fn apply(&mut self, content: &str) -> Result<()> {
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(Error::invalid_config(format!("Expected key=value, got {:?}", line)));
            };
            let value = value.trim();

            match key.trim() {
                "db_path" => {
                    self.db_path = if value.is_empty() {
                        None
                    } else {
                        Some(PathBuf::from(value))
                    }
                }
                "cache_capacity" => self.cache_capacity = parse_size(value)? as u64,
                "max_file_size" => self.max_file_size = parse_size(value)?,
                "revision_author" => {
                    if value.is_empty() {
                        return Err(Error::invalid_config("revision_author cannot be empty"));
                    }
                    self.revision_author = value.to_string();
                }
                _ => {}
            }
        }

        Ok(())
    }
}

/// Parse a human size such as `512`, `64kb`, `100mb` or `1gb`.
pub fn parse_size(value: &str) -> Result<usize> {
    let lower = value.trim().to_ascii_lowercase();
    let (digits, multiplier) = if let Some(n) = lower.strip_suffix("gb") {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = lower.strip_suffix("mb") {
        (n, 1024 * 1024)
    } else if let Some(n) = lower.strip_suffix("kb") {
        (n, 1024)
    } else if let Some(n) = lower.strip_suffix('b') {
        (n, 1)
    } else {
        (lower.as_str(), 1)
    };

    let amount: usize = digits
        .trim()
        .parse()
        .map_err(|_| Error::invalid_config(format!("Invalid size: {:?}", value)))?;

    amount
        .checked_mul(multiplier)
        .ok_or_else(|| Error::invalid_config(format!("Size overflows: {:?}", value)))
}
