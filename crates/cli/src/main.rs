//! dirsync: Directory sync client
//!
//! Pushes local changes to the authoritative server or pulls remote ones,
//! with tombstone-propagated deletions and explicit conflict handling.

use std::path::PathBuf;

use clap::builder::styling::{AnsiColor, Effects};
use clap::{builder::Styles, Parser, ValueEnum};
use color_eyre::Result;
use tracing::{info, warn};

use dirsync_cli::driver::{Driver, SyncOutcome};
use dirsync_core::plan::{ConflictStrategy, SyncMode};
use dirsync_core::scan::Scanner;
use dirsync_core::Config;

const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .usage(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .literal(AnsiColor::Cyan.on_default().effects(Effects::BOLD))
    .placeholder(AnsiColor::Cyan.on_default());

#[derive(Parser)]
#[command(name = "dirsync")]
#[command(version)]
#[command(styles = STYLES)]
#[command(about = "Sync a directory tree against an authoritative server")]
#[command(long_about = r#"
dirsync keeps a local directory in step with an authoritative server.

Modes:
  push     send local changes (and deletions) to the server
  pull     fetch remote changes (and deletions) from the server
  list     list the files currently under the local root
  changes  show what changed locally since the last sync
  status   show local and server version information

Exit codes: 0 success, 1 error or failed transfers, 2 unresolved conflicts.
"#)]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Operation mode
    #[arg(short, long, default_value = "status")]
    mode: Mode,

    /// Conflict handling (overrides the config file)
    #[arg(long)]
    conflict: Option<ConflictArg>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Push,
    Pull,
    List,
    Changes,
    Status,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ConflictArg {
    Ask,
    Local,
    Remote,
    Skip,
}

impl From<ConflictArg> for ConflictStrategy {
    fn from(arg: ConflictArg) -> Self {
        match arg {
            ConflictArg::Ask => Self::Ask,
            ConflictArg::Local => Self::Local,
            ConflictArg::Remote => Self::Remote,
            ConflictArg::Skip => Self::Skip,
        }
    }
}

fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = Config::load(cli.config.as_deref())?;
    let strategy = cli
        .conflict
        .map(ConflictStrategy::from)
        .unwrap_or(config.sync.conflict_strategy);

    match cli.mode {
        Mode::List => list_command(&config),
        Mode::Changes => changes_command(&config),
        Mode::Status => status_command(&config),
        Mode::Push => sync_command(&config, SyncMode::Push, strategy),
        Mode::Pull => sync_command(&config, SyncMode::Pull, strategy),
    }
}

fn sync_command(config: &Config, mode: SyncMode, strategy: ConflictStrategy) -> Result<()> {
    let mut driver = Driver::from_config(config)?;

    match driver.sync(mode, strategy)? {
        SyncOutcome::Completed(stats) => {
            info!(
                "done: {} transferred, {} deleted, {} failed; sync_version {}",
                stats.transferred, stats.deleted, stats.failed, stats.new_sync_version
            );
            if stats.failed > 0 {
                std::process::exit(1);
            }
            Ok(())
        }
        SyncOutcome::Conflicts(conflicts) => {
            warn!("{} conflict(s), nothing synced:", conflicts.len());
            for conflict in &conflicts {
                eprintln!("  {}: {}", conflict.path, conflict.explanation);
            }
            eprintln!("resolve with --conflict {{local|remote|skip}} or fix by hand");
            std::process::exit(2);
        }
    }
}

fn list_command(config: &Config) -> Result<()> {
    let entries = Scanner::new(&config.client.local_root)
        .ignore_all(config.sync.ignore_patterns.iter().cloned())
        .scan()?;

    eprintln!("{} file(s) under {}", entries.len(), config.client.local_root.display());
    for entry in &entries {
        eprintln!("  {} ({} bytes)", entry.path, entry.size);
    }
    Ok(())
}

fn changes_command(config: &Config) -> Result<()> {
    let mut driver = Driver::from_config(config)?;
    let changes = driver.refresh()?;

    if changes.is_empty() {
        eprintln!("no changes since last sync");
        return Ok(());
    }
    for path in &changes.added {
        eprintln!("  added     {path}");
    }
    for path in &changes.modified {
        eprintln!("  modified  {path}");
    }
    for path in &changes.deleted {
        eprintln!("  deleted   {path}");
    }
    Ok(())
}

fn status_command(config: &Config) -> Result<()> {
    let driver = Driver::from_config(config)?;
    let state = &driver.state;

    eprintln!("client id:      {}", state.client_id);
    eprintln!("local root:     {}", config.client.local_root.display());
    eprintln!(
        "entries:        {} active, {} total",
        state.active_count(),
        state.files.len()
    );
    eprintln!("base version:   {}", state.base_version);
    match &state.last_sync_time {
        Some(at) => eprintln!("last sync:      {at}"),
        None => eprintln!("last sync:      never"),
    }

    match driver.server_state() {
        Ok(server) => {
            eprintln!("server version: {}", server.sync_version);
            if server.sync_version > state.base_version {
                eprintln!("status:         behind (pull recommended)");
            } else {
                eprintln!("status:         up to date");
            }
        }
        Err(e) => warn!("server unreachable: {e}"),
    }
    Ok(())
}
