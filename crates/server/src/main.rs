//! dirsync-server: Authoritative sync server binary

use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Arc;

use clap::builder::styling::{AnsiColor, Effects};
use clap::{builder::Styles, Parser};
use color_eyre::Result;

use dirsync_core::Config;
use dirsync_server::ServerCtx;

const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .usage(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .literal(AnsiColor::Cyan.on_default().effects(Effects::BOLD))
    .placeholder(AnsiColor::Cyan.on_default());

#[derive(Parser)]
#[command(name = "dirsync-server")]
#[command(version)]
#[command(styles = STYLES)]
#[command(about = "Authoritative directory sync server")]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address (overrides the config file)
    #[arg(long)]
    bind_address: Option<String>,

    /// Listen port (overrides the config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Data root (overrides the config file)
    #[arg(long)]
    data_root: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(bind_address) = cli.bind_address {
        config.server.bind_address = bind_address;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(data_root) = cli.data_root {
        config.server.data_root = data_root;
    }

    let ctx = Arc::new(ServerCtx::new(&config)?);
    let listener = TcpListener::bind((config.server.bind_address.as_str(), config.server.port))?;
    dirsync_server::run(ctx, listener)
}
