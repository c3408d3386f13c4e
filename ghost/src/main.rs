mod output;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ghost_core::{GhostConfig, GhostService, ScopedGhost, SyncOutcome};
use output::{
    CatOutput, CompactOutput, ExportOutput, LsOutput, OutputWriter, PendingOutput, PutOutput,
    RmOutput, ScopeSync, StatusOutput, SyncOutput,
};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Ghost - A revisioned file store with disk and database backends
#[derive(Parser)]
#[command(name = "ghost")]
#[command(about = "Revisioned file store with disk and database backends", long_about = None)]
#[command(version)]
struct Cli {
    /// Project root containing data/ (defaults to GHOST_ROOT env var or .)
    #[arg(short, long, global = true)]
    root: Option<PathBuf>,

    /// SQLite database; enables DB mode (defaults to GHOST_DB env var)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Work in a bot scope instead of the global scope
    #[arg(short, long, global = true)]
    bot: Option<String>,

    /// Output results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print a file
    Cat {
        /// Path relative to the scope
        path: String,
    },

    /// Write a file from a source file or stdin
    Put {
        /// Path relative to the scope
        path: String,

        /// File to read content from (stdin if omitted)
        source: Option<PathBuf>,
    },

    /// Delete a file
    Rm {
        /// Path relative to the scope
        path: String,
    },

    /// List files
    Ls {
        /// Folder relative to the scope
        #[arg(default_value = "")]
        folder: String,

        /// Glob matched against file names (or paths, if it contains '/')
        #[arg(short, long)]
        pattern: Option<String>,

        /// Glob of paths to leave out
        #[arg(short, long)]
        exclude: Vec<String>,
    },

    /// Replay disk content into the database
    Sync,

    /// Show database revisions not yet on disk
    Pending {
        /// Bots to include
        #[arg(long, num_args = 1..)]
        bots: Vec<String>,
    },

    /// Report whether the scope is fully synced
    Status,

    /// Export the global scope and bots to a tar.gz archive
    Export {
        /// Archive to write
        out: PathBuf,

        /// Bots to include (all bots if omitted)
        #[arg(long, num_args = 1..)]
        bots: Vec<String>,
    },

    /// Drop soft-deleted database rows of a fully synced scope
    Compact,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .try_init();

    let output = OutputWriter::new(cli.json);
    match run(cli, &output) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            output.write_error(&err, 1);
            ExitCode::from(1)
        }
    }
}

fn run(cli: Cli, output: &OutputWriter) -> Result<()> {
    // Determine project root: CLI arg > GHOST_ROOT env var > current directory
    let root = cli
        .root
        .or_else(|| std::env::var("GHOST_ROOT").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("."));
    let db = cli
        .db
        .or_else(|| std::env::var("GHOST_DB").ok().map(PathBuf::from));

    let service = open_service(&root, db)?;
    let bot = cli.bot.as_deref();

    match cli.command {
        Commands::Cat { path } => cmd_cat(&service, bot, &path, output),
        Commands::Put { path, source } => {
            cmd_put(&service, bot, &path, source.as_deref(), output)
        }
        Commands::Rm { path } => cmd_rm(&service, bot, &path, output),
        Commands::Ls {
            folder,
            pattern,
            exclude,
        } => cmd_ls(&service, bot, &folder, pattern.as_deref(), &exclude, output),
        Commands::Sync => cmd_sync(&service, bot, output),
        Commands::Pending { bots } => cmd_pending(&service, bot, bots, output),
        Commands::Status => cmd_status(&service, bot, output),
        Commands::Export { out, bots } => cmd_export(&service, &out, bots, output),
        Commands::Compact => cmd_compact(&service, bot, output),
    }
}

fn open_service(root: &Path, db: Option<PathBuf>) -> Result<GhostService> {
    let mut config = GhostConfig::load(root)
        .with_context(|| format!("Failed to load configuration from {}", root.display()))?;
    if db.is_some() {
        config.db_path = db;
    }

    GhostService::new(config)
        .with_context(|| format!("Failed to open ghost store at {}", root.display()))
}

fn scope_for(service: &GhostService, bot: Option<&str>) -> Result<Arc<ScopedGhost>> {
    match bot {
        Some(id) => service
            .for_bot(id)
            .with_context(|| format!("Invalid bot: {}", id)),
        None => Ok(service.global()),
    }
}

/// Split a scope-relative path into folder and file name.
fn split_path(path: &str) -> (&str, &str) {
    let trimmed = path.trim_matches('/');
    trimmed.rsplit_once('/').unwrap_or(("", trimmed))
}

fn cmd_cat(
    service: &GhostService,
    bot: Option<&str>,
    path: &str,
    output: &OutputWriter,
) -> Result<()> {
    let scope = scope_for(service, bot)?;
    let (folder, file) = split_path(path);

    let content = scope
        .read_file_as_buffer(folder, file)
        .with_context(|| format!("Failed to read {}", path))?;

    if !output.is_json() {
        return output.write_raw(&content);
    }

    let data = CatOutput {
        success: true,
        result_code: 0,
        path: path.to_string(),
        size: content.len(),
        content: String::from_utf8_lossy(&content).into_owned(),
    };
    output.write(&data, String::new)
}

fn cmd_put(
    service: &GhostService,
    bot: Option<&str>,
    path: &str,
    source: Option<&Path>,
    output: &OutputWriter,
) -> Result<()> {
    let scope = scope_for(service, bot)?;
    let (folder, file) = split_path(path);

    let content = match source {
        Some(source) => std::fs::read(source)
            .with_context(|| format!("Failed to read {}", source.display()))?,
        None => {
            let mut buffer = Vec::new();
            io::stdin()
                .read_to_end(&mut buffer)
                .context("Failed to read stdin")?;
            buffer
        }
    };

    scope
        .upsert_file(folder, file, &content)
        .with_context(|| format!("Failed to write {}", path))?;

    let data = PutOutput {
        success: true,
        result_code: 0,
        path: path.to_string(),
        size: content.len(),
    };
    output.write(&data, || format!("Wrote {} ({} bytes)\n", path, content.len()))
}

fn cmd_rm(
    service: &GhostService,
    bot: Option<&str>,
    path: &str,
    output: &OutputWriter,
) -> Result<()> {
    let scope = scope_for(service, bot)?;
    let (folder, file) = split_path(path);

    scope
        .delete_file(folder, file)
        .with_context(|| format!("Failed to delete {}", path))?;

    let data = RmOutput {
        success: true,
        result_code: 0,
        path: path.to_string(),
    };
    output.write(&data, || format!("Removed {}\n", path))
}

fn cmd_ls(
    service: &GhostService,
    bot: Option<&str>,
    folder: &str,
    pattern: Option<&str>,
    excludes: &[String],
    output: &OutputWriter,
) -> Result<()> {
    let scope = scope_for(service, bot)?;
    let excludes: Vec<&str> = excludes.iter().map(String::as_str).collect();

    let files = scope
        .directory_listing(folder, pattern, &excludes)
        .with_context(|| format!("Failed to list {}", folder))?;

    let data = LsOutput {
        success: true,
        result_code: 0,
        scope: scope.name().to_string(),
        folder: folder.to_string(),
        files,
    };
    output.write(&data, || {
        if data.files.is_empty() {
            return "No files\n".to_string();
        }
        data.files.iter().map(|f| format!("{}\n", f)).collect()
    })
}

fn cmd_sync(service: &GhostService, bot: Option<&str>, output: &OutputWriter) -> Result<()> {
    let scopes = match bot {
        Some(_) => vec![scope_for(service, bot)?],
        None => vec![service.global(), service.bots()],
    };

    let mut results = Vec::new();
    for scope in scopes {
        let outcome = scope
            .sync()
            .with_context(|| format!("Failed to sync {}", scope.name()))?;
        results.push(ScopeSync {
            scope: scope.name().to_string(),
            outcome,
        });
    }

    let data = SyncOutput {
        success: true,
        result_code: 0,
        scopes: results,
    };
    output.write(&data, || {
        data.scopes
            .iter()
            .map(|s| match &s.outcome {
                SyncOutcome::Disabled => format!("{}: DB mode is off, nothing to sync\n", s.scope),
                SyncOutcome::Blocked { unsynced } => format!(
                    "{}: blocked, {} revision(s) not on disk yet\n",
                    s.scope, unsynced
                ),
                SyncOutcome::Synced(stats) => format!(
                    "{}: synced {} folder(s), {} file(s) written, {} removed, {} revision(s) cleared\n",
                    s.scope,
                    stats.folders,
                    stats.files_upserted,
                    stats.files_deleted,
                    stats.revisions_cleared
                ),
            })
            .collect()
    })
}

fn cmd_pending(
    service: &GhostService,
    bot: Option<&str>,
    mut bots: Vec<String>,
    output: &OutputWriter,
) -> Result<()> {
    if let Some(id) = bot {
        bots.push(id.to_string());
    }
    let ids: Vec<&str> = bots.iter().map(String::as_str).collect();

    let pending = service
        .get_pending(&ids)
        .context("Failed to list pending revisions")?;

    let data = PendingOutput {
        success: true,
        result_code: 0,
        db_mode: service.is_db_mode(),
        pending,
    };
    output.write(&data, || {
        let Some(pending) = &data.pending else {
            return "DB mode is off, nothing is pending\n".to_string();
        };

        let mut text = String::new();
        let sections = std::iter::once(("global".to_string(), &pending.global)).chain(
            ids.iter()
                .zip(&pending.bots)
                .map(|(id, p)| (format!("bot {}", id), p)),
        );
        for (label, folders) in sections {
            let count: usize = folders.values().map(Vec::len).sum();
            text.push_str(&format!("{}: {} pending revision(s)\n", label, count));
            for (folder, revisions) in folders {
                for revision in revisions {
                    text.push_str(&format!(
                        "  [{}] {} {} by {} at {}\n",
                        folder,
                        revision.revision,
                        revision.path,
                        revision.created_by,
                        revision.created_on.to_rfc3339()
                    ));
                }
            }
        }
        text
    })
}

fn cmd_status(service: &GhostService, bot: Option<&str>, output: &OutputWriter) -> Result<()> {
    let scope = scope_for(service, bot)?;

    let fully_synced = scope
        .is_fully_synced()
        .with_context(|| format!("Failed to read status of {}", scope.name()))?;
    let pending_revisions = scope.list_db_revisions()?.len();

    let data = StatusOutput {
        success: true,
        result_code: 0,
        scope: scope.name().to_string(),
        db_mode: service.is_db_mode(),
        fully_synced,
        pending_revisions,
    };
    output.write(&data, || {
        let mode = if data.db_mode { "database" } else { "disk" };
        let state = if data.fully_synced {
            "fully synced".to_string()
        } else {
            format!("{} pending revision(s)", data.pending_revisions)
        };
        format!("{} ({}): {}\n", data.scope, mode, state)
    })
}

fn cmd_export(
    service: &GhostService,
    out: &Path,
    bots: Vec<String>,
    output: &OutputWriter,
) -> Result<()> {
    let bots = if bots.is_empty() {
        service.bot_ids().context("Failed to list bots")?
    } else {
        bots
    };
    let ids: Vec<&str> = bots.iter().map(String::as_str).collect();

    let archive = service
        .export_archive(&ids)
        .context("Failed to build archive")?;
    std::fs::write(out, &archive)
        .with_context(|| format!("Failed to write {}", out.display()))?;

    let data = ExportOutput {
        success: true,
        result_code: 0,
        archive: out.display().to_string(),
        size: archive.len(),
        bots,
    };
    output.write(&data, || {
        format!(
            "Exported global and {} bot(s) to {} ({} bytes)\n",
            data.bots.len(),
            data.archive,
            data.size
        )
    })
}

fn cmd_compact(service: &GhostService, bot: Option<&str>, output: &OutputWriter) -> Result<()> {
    let scope = scope_for(service, bot)?;

    let rows_removed = scope
        .compact()
        .with_context(|| format!("Failed to compact {}", scope.name()))?;

    let data = CompactOutput {
        success: true,
        result_code: 0,
        scope: scope.name().to_string(),
        rows_removed,
    };
    output.write(&data, || {
        format!("{}: removed {} deleted row(s)\n", data.scope, data.rows_removed)
    })
}
