//! dirsync-server: Authoritative sync server
//!
//! Owns the server-side state document and serializes every mutating session
//! against it. Connection acceptance is concurrent (one OS thread per
//! connection); plan computation snapshots the state under the guard, and a
//! push commit is a single critical section that bumps the global version.

pub mod session;

use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use color_eyre::eyre::eyre;
use color_eyre::Result;
use tracing::{debug, info, warn};

use dirsync_core::config::Config;
use dirsync_core::crypto::Cipher;
use dirsync_core::scan::Scanner;
use dirsync_core::state::{SyncState, SERVER_CLIENT_ID, SERVER_STATE_FILE};

/// Shared server context: configuration plus the guarded authoritative state
pub struct ServerCtx {
    pub data_root: PathBuf,
    pub state_path: PathBuf,
    pub cipher: Option<Cipher>,
    pub compression: bool,
    pub chunk_size: u64,
    pub idle_timeout: Duration,
    pub ignore_patterns: Vec<String>,
    state: Mutex<SyncState>,
}

impl ServerCtx {
    /// Validate the configuration and load (or initialize) the state.
    ///
    /// # Errors
    /// Fails fast on an unusable data root or, with encryption enabled, a
    /// missing or malformed key file.
    pub fn new(config: &Config) -> Result<Self> {
        let data_root = config.server.data_root.clone();
        std::fs::create_dir_all(&data_root)
            .map_err(|e| eyre!("cannot create data root {}: {e}", data_root.display()))?;

        let cipher = if config.encryption.enabled {
            Some(Cipher::from_key_file(&config.encryption.key_file)?)
        } else {
            None
        };

        let state_path = data_root.join(SERVER_STATE_FILE);
        let state =
            SyncState::load(&state_path).unwrap_or_else(|| SyncState::new(SERVER_CLIENT_ID));
        info!(
            "server state loaded: {} entries, sync_version {}",
            state.files.len(),
            state.sync_version
        );

        Ok(Self {
            data_root,
            state_path,
            cipher,
            compression: config.sync.compression,
            chunk_size: config.sync.chunk_size,
            idle_timeout: Duration::from_secs(config.server.idle_timeout),
            ignore_patterns: config.sync.ignore_patterns.clone(),
            state: Mutex::new(state),
        })
    }

    /// Lock the state guard
    ///
    /// # Panics
    /// Panics if a previous holder poisoned the lock.
    pub fn lock_state(&self) -> MutexGuard<'_, SyncState> {
        self.state.lock().expect("state guard poisoned")
    }

    /// Rescan the data root and fold direct server-side edits into the
    /// authoritative state. Call with the guard held.
    ///
    /// # Errors
    /// Returns an error if scanning or persistence fails
    pub fn refresh(&self, state: &mut SyncState) -> Result<()> {
        let scanned = Scanner::new(&self.data_root)
            .ignore_all(self.ignore_patterns.iter().cloned())
            .scan()?;
        let changes = state.reconcile(scanned, Utc::now());

        if !changes.is_empty() {
            // Local edits count as commits: the global version must stay
            // ahead of every per-file version
            let touched = state.files.values().map(|e| e.version).max().unwrap_or(0);
            state.sync_version = (state.sync_version + 1).max(touched);
            debug!(
                "data root changed outside a session (+{} ~{} -{}), sync_version now {}",
                changes.added.len(),
                changes.modified.len(),
                changes.deleted.len(),
                state.sync_version
            );
            state.save(&self.state_path)?;
        }

        Ok(())
    }

    /// Refresh under the guard and return a snapshot for plan computation
    ///
    /// # Errors
    /// Returns an error if the refresh fails
    pub fn snapshot(&self) -> Result<SyncState> {
        let mut state = self.lock_state();
        self.refresh(&mut state)?;
        Ok(state.clone())
    }
}

/// Accept connections until the listener fails, one session thread each
///
/// # Errors
/// Returns an error if `accept` fails
pub fn run(ctx: Arc<ServerCtx>, listener: TcpListener) -> Result<()> {
    info!(
        "listening on {}, data root {}",
        listener.local_addr()?,
        ctx.data_root.display()
    );

    loop {
        let (stream, peer) = listener.accept()?;
        info!("client connected: {peer}");

        let ctx = Arc::clone(&ctx);
        std::thread::spawn(move || {
            if let Err(e) = session::handle_connection(stream, ctx) {
                warn!("session {peer} ended with error: {e}");
            } else {
                debug!("session {peer} closed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_in(dir: &std::path::Path) -> ServerCtx {
        let mut config = Config::default();
        config.server.data_root = dir.join("data");
        ServerCtx::new(&config).unwrap()
    }

    #[test]
    fn test_new_ctx_creates_root_and_empty_state() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_in(dir.path());

        assert!(ctx.data_root.is_dir());
        let state = ctx.lock_state();
        assert_eq!(state.client_id, SERVER_CLIENT_ID);
        assert_eq!(state.sync_version, 0);
    }

    #[test]
    fn test_missing_key_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.server.data_root = dir.path().join("data");
        config.encryption.enabled = true;
        config.encryption.key_file = dir.path().join("absent.key");

        assert!(ServerCtx::new(&config).is_err());
    }

    #[test]
    fn test_refresh_versions_direct_edits() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_in(dir.path());

        std::fs::write(ctx.data_root.join("direct.txt"), b"edited on server").unwrap();
        let snapshot = ctx.snapshot().unwrap();

        assert_eq!(snapshot.files["direct.txt"].version, 1);
        assert_eq!(snapshot.sync_version, 1);
        // State was persisted
        assert!(ctx.state_path.is_file());

        // A second snapshot with no changes does not bump
        let again = ctx.snapshot().unwrap();
        assert_eq!(again.sync_version, 1);
    }

    #[test]
    fn test_state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let ctx = ctx_in(dir.path());
            std::fs::write(ctx.data_root.join("kept.txt"), b"persist me").unwrap();
            ctx.snapshot().unwrap();
        }

        let ctx = ctx_in(dir.path());
        let state = ctx.lock_state();
        assert_eq!(state.files["kept.txt"].version, 1);
        assert_eq!(state.sync_version, 1);
    }
}
