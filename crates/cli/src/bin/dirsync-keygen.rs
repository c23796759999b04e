//! dirsync-keygen: Generate the shared symmetric key
//!
//! Writes one freshly generated key to both key files (the construction is
//! symmetric, so server and client share it). Files are created
//! owner-readable only.

use std::path::PathBuf;

use clap::Parser;
use color_eyre::Result;

use dirsync_core::crypto::{write_key_file, Cipher};

#[derive(Parser)]
#[command(name = "dirsync-keygen")]
#[command(version)]
#[command(about = "Generate a shared key pair for encrypted sync")]
struct Cli {
    /// Where to write the server's copy of the key
    #[arg(long, default_value = "server.key")]
    server_key: PathBuf,

    /// Where to write the client's copy of the key
    #[arg(long, default_value = "client.key")]
    client_key: PathBuf,
}

fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    let key = Cipher::generate_key();
    write_key_file(&cli.server_key, &key)?;
    write_key_file(&cli.client_key, &key)?;

    eprintln!("server key: {}", cli.server_key.display());
    eprintln!("client key: {}", cli.client_key.display());
    Ok(())
}
