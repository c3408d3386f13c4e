//! Error types for ghost_core.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using ghost_core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during ghost operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A required file is absent.
    #[error("File not found: {path}")]
    NotFound { path: String },

    /// The scope still has DB revisions that are not mirrored on disk.
    #[error("Scope {scope} has {pending} unsynced revision(s)")]
    Unsynced { scope: String, pending: usize },

    /// Mutation attempted on a wildcard scope.
    #[error("Scope {scope} is read-only")]
    ReadOnlyScope { scope: String },

    /// Scope base directory is malformed.
    #[error("Invalid scope {base}: {reason}")]
    InvalidScope { base: String, reason: String },

    /// Bot identifier does not match the allowed syntax.
    #[error("Invalid bot id: {id:?}")]
    InvalidBotId { id: String },

    /// Logical path cannot be normalized.
    #[error("Invalid path {path}: {reason}")]
    InvalidPath { path: String, reason: String },

    /// Content exceeds the configured size limit.
    #[error("File {path} is {size} bytes, over the {limit} byte limit")]
    FileTooLarge { path: String, size: usize, limit: usize },

    /// I/O error occurred during file operations.
    #[error("I/O error during {op} on {}: {source}", .path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Database statement failed.
    #[error("Database error during {op} on {path}: {source}")]
    Database {
        op: &'static str,
        path: String,
        #[source]
        source: rusqlite::Error,
    },

    /// JSON content could not be parsed or written.
    #[error("Invalid JSON in {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    /// UTF-8 decoding error.
    #[error("UTF-8 error in {path}: {source}")]
    Utf8 {
        path: String,
        #[source]
        source: std::string::FromUtf8Error,
    },

    /// Configuration file or value is invalid.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}

impl Error {
    /// Create a NotFound error.
    pub fn not_found(path: impl Into<String>) -> Self {
        Error::NotFound { path: path.into() }
    }

    /// Create an Unsynced error.
    pub fn unsynced(scope: impl Into<String>, pending: usize) -> Self {
        Error::Unsynced {
            scope: scope.into(),
            pending,
        }
    }

    /// Create a ReadOnlyScope error.
    pub fn read_only_scope(scope: impl Into<String>) -> Self {
        Error::ReadOnlyScope {
            scope: scope.into(),
        }
    }

    /// Create an InvalidScope error.
    pub fn invalid_scope(base: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidScope {
            base: base.into(),
            reason: reason.into(),
        }
    }

    /// Create an InvalidBotId error.
    pub fn invalid_bot_id(id: impl Into<String>) -> Self {
        Error::InvalidBotId { id: id.into() }
    }

    /// Create an InvalidPath error.
    pub fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a FileTooLarge error.
    pub fn file_too_large(path: impl Into<String>, size: usize, limit: usize) -> Self {
        Error::FileTooLarge {
            path: path.into(),
            size,
            limit,
        }
    }

    /// Wrap an I/O error with the failing operation and path.
    pub fn io(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            op,
            path: path.into(),
            source,
        }
    }

    /// Wrap a database error with the failing operation and logical path.
    pub fn database(op: &'static str, path: impl Into<String>, source: rusqlite::Error) -> Self {
        Error::Database {
            op,
            path: path.into(),
            source,
        }
    }

    /// Create a Json error.
    pub fn json(path: impl Into<String>, source: serde_json::Error) -> Self {
        Error::Json {
            path: path.into(),
            source,
        }
    }

    /// Create a Utf8 error.
    pub fn utf8(path: impl Into<String>, source: std::string::FromUtf8Error) -> Self {
        Error::Utf8 {
            path: path.into(),
            source,
        }
    }

    /// Create an InvalidConfig error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Error::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Whether this error means the requested file does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }
}

// Wrapping for external error types

impl Error {
    /// Wrap a directory walk failure from the `ignore` crate.
    pub(crate) fn walk(path: impl Into<PathBuf>, err: ignore::Error) -> Self {
        // ignore::Error can wrap an io::Error or be a path error
        let source = match err.io_error() {
            Some(io_err) => std::io::Error::new(io_err.kind(), io_err.to_string()),
            None => std::io::Error::other(err.to_string()),
        };
        Error::io("walk", path, source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_display() {
        let err = Error::not_found("data/global/a.json");
        assert_eq!(err.to_string(), "File not found: data/global/a.json");
        assert!(err.is_not_found());
    }

    #[test]
    fn test_io_error_carries_context() {
        let err = Error::io(
            "read",
            "/tmp/x",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        let msg = err.to_string();
        assert!(msg.contains("read"));
        assert!(msg.contains("/tmp/x"));
        assert!(!err.is_not_found());
    }
}
