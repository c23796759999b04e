//! Configuration file parsing
//!
//! TOML with four sections. Every key has a default, so a missing file or a
//! partial one still yields a usable configuration.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Default TCP port
pub const DEFAULT_PORT: u16 = 8888;

/// Whole configuration document
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub sync: SyncConfig,
    pub encryption: EncryptionConfig,
}

/// `[server]` section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Advertised host; `client.remote_host` falls back to this
    pub host: String,
    /// Advertised port; `client.remote_port` falls back to this
    pub port: u16,
    /// Address the listener binds
    pub bind_address: String,
    /// Authoritative sync root
    pub data_root: PathBuf,
    /// Seconds before a stalled session is dropped
    pub idle_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            bind_address: "0.0.0.0".to_string(),
            data_root: PathBuf::from("./server_files"),
            idle_timeout: 60,
        }
    }
}

/// `[client]` section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server to connect to; empty means "use `server.host`"
    pub remote_host: String,
    /// 0 means "use `server.port`"
    pub remote_port: u16,
    /// Local sync root
    pub local_root: PathBuf,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            remote_host: String::new(),
            remote_port: 0,
            local_root: PathBuf::from("./client_files"),
        }
    }
}

/// `[sync]` section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Globs skipped during scans (gitignore syntax)
    pub ignore_patterns: Vec<String>,
    /// zlib-compress large payloads on the wire
    pub compression: bool,
    /// Body-frame size for large file transfers
    pub chunk_size: u64,
    /// Default conflict handling, overridable per run
    pub conflict_strategy: crate::plan::ConflictStrategy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            ignore_patterns: vec!["*.tmp".to_string()],
            compression: false,
            chunk_size: 65536,
            conflict_strategy: crate::plan::ConflictStrategy::Ask,
        }
    }
}

/// `[encryption]` section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    pub enabled: bool,
    /// Single-line URL-safe base64 key, 32 bytes decoded
    pub key_file: PathBuf,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            key_file: PathBuf::from("./sync.key"),
        }
    }
}

impl Config {
    /// Load a configuration file, or defaults when `path` is `None`.
    ///
    /// # Errors
    /// Returns an error if the file is missing or not valid TOML.
    pub fn load(path: Option<&Path>) -> color_eyre::Result<Self> {
        match path {
            Some(path) => {
                let contents = std::fs::read_to_string(path).map_err(|e| {
                    color_eyre::eyre::eyre!("cannot read config {}: {e}", path.display())
                })?;
                let config: Self = toml::from_str(&contents)?;
                Ok(config)
            }
            None => Ok(Self::default()),
        }
    }

    /// Endpoint the client dials, with `[server]` fallbacks applied
    #[must_use]
    pub fn remote_endpoint(&self) -> (String, u16) {
        let host = if self.client.remote_host.is_empty() {
            self.server.host.clone()
        } else {
            self.client.remote_host.clone()
        };
        let port = if self.client.remote_port == 0 {
            self.server.port
        } else {
            self.client.remote_port
        };
        (host, port)
    }
}
