//! Output formatting for CLI commands.
//!
//! Provides abstraction layer for outputting results in text or JSON format.

use anyhow::Result;
use ghost_core::{ServerWidePending, SyncOutcome};
use serde::Serialize;
use std::io::{self, Write};

/// Output format selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Writer for command output with format abstraction.
pub struct OutputWriter {
    format: OutputFormat,
    stdout: io::Stdout,
}

impl OutputWriter {
    /// Create a new OutputWriter.
    pub fn new(json: bool) -> Self {
        Self {
            format: if json {
                OutputFormat::Json
            } else {
                OutputFormat::Text
            },
            stdout: io::stdout(),
        }
    }

    /// Check if JSON mode is enabled.
    pub fn is_json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    /// Write output using the configured format.
    ///
    /// The `text_fn` closure is called only in text mode to generate the
    /// human-readable output.
    pub fn write<T: Serialize>(&self, data: &T, text_fn: impl FnOnce() -> String) -> Result<()> {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::to_string_pretty(data)?;
                writeln!(&self.stdout, "{}", json)?;
            }
            OutputFormat::Text => {
                let text = text_fn();
                if !text.is_empty() {
                    write!(&self.stdout, "{}", text)?;
                }
            }
        }
        Ok(())
    }

    /// Write raw bytes to stdout (text mode file content).
    pub fn write_raw(&self, bytes: &[u8]) -> Result<()> {
        let mut handle = self.stdout.lock();
        handle.write_all(bytes)?;
        handle.flush()?;
        Ok(())
    }

    /// Write an error message to stderr.
    ///
    /// In JSON mode, writes a JSON error object with success=false.
    pub fn write_error(&self, error: &anyhow::Error, result_code: u8) {
        match self.format {
            OutputFormat::Json => {
                let error_output = ErrorOutput {
                    success: false,
                    result_code,
                    error: format!("{:#}", error),
                };
                if let Ok(json) = serde_json::to_string_pretty(&error_output) {
                    let _ = writeln!(io::stderr(), "{}", json);
                }
            }
            OutputFormat::Text => {
                let _ = writeln!(io::stderr(), "Error: {:#}", error);
            }
        }
    }
}

// ============================================================================
// Data Transfer Objects (DTOs) for JSON output
// ============================================================================

/// Error output structure.
#[derive(Debug, Serialize)]
pub struct ErrorOutput {
    pub success: bool,
    pub result_code: u8,
    pub error: String,
}

/// Output for `cat` in JSON mode.
#[derive(Debug, Serialize)]
pub struct CatOutput {
    pub success: bool,
    pub result_code: u8,
    pub path: String,
    pub size: usize,
    pub content: String,
}

/// Output for `put` command.
#[derive(Debug, Serialize)]
pub struct PutOutput {
    pub success: bool,
    pub result_code: u8,
    pub path: String,
    pub size: usize,
}

/// Output for `rm` command.
#[derive(Debug, Serialize)]
pub struct RmOutput {
    pub success: bool,
    pub result_code: u8,
    pub path: String,
}

/// Output for `ls` command.
#[derive(Debug, Serialize)]
pub struct LsOutput {
    pub success: bool,
    pub result_code: u8,
    pub scope: String,
    pub folder: String,
    pub files: Vec<String>,
}

/// Sync result for one scope.
#[derive(Debug, Serialize)]
pub struct ScopeSync {
    pub scope: String,
    pub outcome: SyncOutcome,
}

/// Output for `sync` command.
#[derive(Debug, Serialize)]
pub struct SyncOutput {
    pub success: bool,
    pub result_code: u8,
    pub scopes: Vec<ScopeSync>,
}

/// Output for `pending` command.
#[derive(Debug, Serialize)]
pub struct PendingOutput {
    pub success: bool,
    pub result_code: u8,
    pub db_mode: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending: Option<ServerWidePending>,
}

/// Output for `status` command.
#[derive(Debug, Serialize)]
pub struct StatusOutput {
    pub success: bool,
    pub result_code: u8,
    pub scope: String,
    pub db_mode: bool,
    pub fully_synced: bool,
    pub pending_revisions: usize,
}

/// Output for `export` command.
#[derive(Debug, Serialize)]
pub struct ExportOutput {
    pub success: bool,
    pub result_code: u8,
    pub archive: String,
    pub size: usize,
    pub bots: Vec<String>,
}

/// Output for `compact` command.
#[derive(Debug, Serialize)]
pub struct CompactOutput {
    pub success: bool,
    pub result_code: u8,
    pub scope: String,
    pub rows_removed: usize,
}
