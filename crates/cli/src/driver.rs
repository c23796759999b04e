//! Client session driver
//!
//! Orchestrates one sync session end-to-end: load and reconcile the local
//! state, connect, negotiate a plan, execute it, adopt the server's new
//! global version, and persist. Received files are written via a sibling
//! temp file and renamed into place; local deletions only apply when the
//! server's version dominates.

use std::io::{BufReader, BufWriter, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use color_eyre::eyre::{bail, eyre};
use color_eyre::Result;
use tracing::{debug, info, warn};

use dirsync_core::config::Config;
use dirsync_core::crypto::Cipher;
use dirsync_core::envelope;
use dirsync_core::frame::FrameCodec;
use dirsync_core::hash;
use dirsync_core::plan::{Action, Conflict, ConflictStrategy, SyncMode};
use dirsync_core::protocol::{
    chunk_count, parse_reply, session_digest, CompleteReply, DeleteRequest, FileHeader, Hello,
    HelloReply, Message, PlanReply, ProtocolReader, ProtocolWriter, StateReply, SyncComplete,
    SyncRequest, PROTOCOL_VERSION,
};
use dirsync_core::scan::{is_valid_relative_path, Scanner};
use dirsync_core::state::{ChangeSet, FileEntry, FileStatus, SyncState, CLIENT_STATE_FILE};

/// Read timeout for one session
const SESSION_TIMEOUT: Duration = Duration::from_secs(60);

/// Counters from an executed plan
#[derive(Debug, Default, Clone, Copy)]
pub struct SyncStats {
    pub transferred: usize,
    pub deleted: usize,
    pub adopted: usize,
    pub failed: usize,
    pub new_sync_version: u64,
}

/// How a session ended
#[derive(Debug)]
pub enum SyncOutcome {
    Completed(SyncStats),
    /// Strategy `ask` surfaced these; nothing was mutated anywhere
    Conflicts(Vec<Conflict>),
}

struct Channel {
    reader: ProtocolReader<BufReader<TcpStream>>,
    writer: ProtocolWriter<BufWriter<TcpStream>>,
}

/// One client endpoint bound to a local root and a remote server
pub struct Driver {
    local_root: PathBuf,
    state_path: PathBuf,
    remote: (String, u16),
    cipher: Option<Cipher>,
    compression: bool,
    chunk_size: u64,
    ignore_patterns: Vec<String>,
    pub state: SyncState,
}

impl Driver {
    /// Build a driver from configuration, loading or initializing the local
    /// state document.
    ///
    /// # Errors
    /// Fails if the local root cannot be created or, with encryption
    /// enabled, the key file is missing or malformed.
    pub fn from_config(config: &Config) -> Result<Self> {
        let local_root = config.client.local_root.clone();
        std::fs::create_dir_all(&local_root)
            .map_err(|e| eyre!("cannot create local root {}: {e}", local_root.display()))?;

        let cipher = if config.encryption.enabled {
            Some(Cipher::from_key_file(&config.encryption.key_file)?)
        } else {
            None
        };

        let state_path = local_root.join(CLIENT_STATE_FILE);
        let state = SyncState::load(&state_path)
            .unwrap_or_else(|| SyncState::new(SyncState::generate_client_id()));
        debug!(
            "client {} at base_version {}",
            state.client_id, state.base_version
        );

        Ok(Self {
            local_root,
            state_path,
            remote: config.remote_endpoint(),
            cipher,
            compression: config.sync.compression,
            chunk_size: config.sync.chunk_size,
            ignore_patterns: config.sync.ignore_patterns.clone(),
            state,
        })
    }

    /// Rescan the local root and fold the result into the in-memory state
    ///
    /// # Errors
    /// Returns an error if the scan fails
    pub fn refresh(&mut self) -> Result<ChangeSet> {
        let scanned = Scanner::new(&self.local_root)
            .ignore_all(self.ignore_patterns.iter().cloned())
            .scan()?;
        Ok(self.state.reconcile(scanned, Utc::now()))
    }

    fn connect(&self) -> Result<Channel> {
        let stream = TcpStream::connect((self.remote.0.as_str(), self.remote.1))
            .map_err(|e| eyre!("cannot reach {}:{}: {e}", self.remote.0, self.remote.1))?;
        stream.set_read_timeout(Some(SESSION_TIMEOUT))?;
        stream.set_nodelay(true)?;

        let codec = match &self.cipher {
            Some(cipher) => FrameCodec::encrypted(cipher.clone()),
            None => FrameCodec::plaintext(),
        };

        Ok(Channel {
            reader: ProtocolReader::new(BufReader::new(stream.try_clone()?), codec.clone()),
            writer: ProtocolWriter::new(BufWriter::new(stream), codec, self.compression),
        })
    }

    fn handshake(&self, channel: &mut Channel) -> Result<HelloReply> {
        channel.writer.send_hello(&Hello {
            client_id: self.state.client_id.clone(),
            protocol_version: PROTOCOL_VERSION,
        })?;

        let reply: HelloReply = parse_reply(&channel.reader.read_ok()?)?;
        if reply.protocol_version != PROTOCOL_VERSION {
            bail!(
                "server speaks protocol {} (want {PROTOCOL_VERSION})",
                reply.protocol_version
            );
        }
        Ok(reply)
    }

    /// Fetch the server's state document (`status` mode)
    ///
    /// # Errors
    /// Returns an error if the server is unreachable or replies badly
    pub fn server_state(&self) -> Result<SyncState> {
        let mut channel = self.connect()?;
        self.handshake(&mut channel)?;

        channel.writer.send_get_state()?;
        let payload = channel.reader.read_ok()?;
        let json = envelope::unpack(&payload)?;
        let reply: StateReply = serde_json::from_slice(&json)?;
        Ok(reply.state)
    }

    /// Run one push or pull session
    ///
    /// # Errors
    /// Returns an error on connection loss or protocol violations; transfer
    /// failures are counted in the outcome instead.
    pub fn sync(&mut self, mode: SyncMode, strategy: ConflictStrategy) -> Result<SyncOutcome> {
        let changes = self.refresh()?;
        if !changes.is_empty() {
            info!(
                "local changes: +{} ~{} -{}",
                changes.added.len(),
                changes.modified.len(),
                changes.deleted.len()
            );
        }

        let mut channel = self.connect()?;
        let hello = self.handshake(&mut channel)?;
        debug!("server at sync_version {}", hello.server_version);

        channel.writer.send_sync_request(&SyncRequest {
            mode,
            base_version: self.state.base_version,
            strategy,
            local_state: self.state.clone(),
        })?;

        let plan = match channel.reader.read_message()? {
            Message::Conflict(reply) => {
                warn!("{} unresolved conflict(s)", reply.conflicts.len());
                return Ok(SyncOutcome::Conflicts(reply.conflicts));
            }
            Message::Ok(payload) => parse_reply::<PlanReply>(&payload)?.plan,
            Message::Error(message) => bail!("server refused sync: {message}"),
            other => bail!("unexpected reply: {}", other.token()),
        };

        info!(
            "plan: {} transfer(s), {} delete(s)",
            plan.transfer_count(),
            plan.delete_count()
        );

        let (mut stats, digest) = match mode {
            SyncMode::Push => self.execute_push(&mut channel, &plan.actions)?,
            SyncMode::Pull => self.execute_pull(&mut channel, &plan.actions)?,
        };

        channel.writer.send_sync_complete(&SyncComplete {
            uploaded: stats.transferred as u32,
            deleted: stats.deleted as u32,
            new_state_digest: digest,
        })?;
        let reply: CompleteReply = parse_reply(&channel.reader.read_ok()?)?;
        stats.new_sync_version = reply.new_sync_version;

        if stats.failed == 0 {
            self.state.sync_version = reply.new_sync_version;
            self.state.base_version = reply.new_sync_version;
            self.state.last_sync_time = Some(Utc::now());
        } else {
            warn!(
                "{} transfer(s) failed; base version stays at {}",
                stats.failed, self.state.base_version
            );
        }
        self.state.save(&self.state_path)?;

        Ok(SyncOutcome::Completed(stats))
    }

    /// Returns the counters plus the session digest over what was applied
    fn execute_push(
        &mut self,
        channel: &mut Channel,
        actions: &[Action],
    ) -> Result<(SyncStats, String)> {
        let mut stats = SyncStats::default();
        let mut uploads: Vec<(String, String)> = Vec::new();
        let mut deletes: Vec<String> = Vec::new();

        for action in actions {
            match action {
                Action::Upload { path } => match self.upload_file(channel, path)? {
                    Some(digest) => {
                        stats.transferred += 1;
                        uploads.push((path.clone(), digest));
                    }
                    None => stats.failed += 1,
                },
                Action::DeleteRemote { path, version } => {
                    channel.writer.send_delete_file(&DeleteRequest {
                        path: path.clone(),
                        version: *version,
                    })?;
                    match channel.reader.read_message()? {
                        Message::Ok(_) => {
                            stats.deleted += 1;
                            deletes.push(path.clone());
                            // Forced deletes may carry an inflated version;
                            // keep the local tombstone in step
                            if let Some(entry) = self.state.files.get_mut(path) {
                                entry.version = entry.version.max(*version);
                            }
                        }
                        Message::Error(message) => {
                            warn!("server rejected delete of {path}: {message}");
                            stats.failed += 1;
                        }
                        other => bail!("expected delete ack, got {}", other.token()),
                    }
                }
                Action::AdoptVersion { path, version } => {
                    if let Some(entry) = self.state.files.get_mut(path) {
                        entry.version = *version;
                    }
                    stats.adopted += 1;
                }
                // A push plan never downloads or deletes locally
                _ => {}
            }
        }

        Ok((stats, session_digest(&uploads, &deletes)))
    }

    /// Returns the uploaded content hash, or `None` when only this transfer
    /// failed
    fn upload_file(&mut self, channel: &mut Channel, path: &str) -> Result<Option<String>> {
        let Some(entry) = self.state.files.get(path).filter(|e| e.is_active()) else {
            warn!("planned upload vanished from state: {path}");
            return Ok(None);
        };

        let data = match std::fs::read(self.local_root.join(path)) {
            Ok(data) => data,
            Err(e) => {
                warn!("cannot read {path}: {e}");
                return Ok(None);
            }
        };

        // Hash the bytes actually being sent; the file may have changed
        // since the scan
        let digest = hash::bytes_digest(&data);
        let chunks = chunk_count(data.len() as u64, self.chunk_size);

        channel.writer.send_file_header(&FileHeader {
            path: path.to_string(),
            size: data.len() as u64,
            hash: digest.clone(),
            version: entry.version,
            modified: entry.modified,
            chunks,
        })?;

        match channel.reader.read_message()? {
            Message::Ok(_) => {}
            Message::Error(message) => {
                warn!("server refused {path}: {message}");
                return Ok(None);
            }
            other => bail!("expected transfer ack, got {}", other.token()),
        }

        if chunks == 1 {
            channel.writer.send_file_chunk(&data)?;
        } else {
            for chunk in data.chunks(self.chunk_size as usize) {
                channel.writer.send_file_chunk(chunk)?;
            }
        }

        match channel.reader.read_message()? {
            Message::Ok(_) => {
                debug!("uploaded {path} ({} bytes)", data.len());
                Ok(Some(digest))
            }
            Message::Error(message) => {
                warn!("server rejected {path}: {message}");
                Ok(None)
            }
            other => bail!("expected transfer ack, got {}", other.token()),
        }
    }

    /// Returns the counters plus the session digest over what was applied
    fn execute_pull(
        &mut self,
        channel: &mut Channel,
        actions: &[Action],
    ) -> Result<(SyncStats, String)> {
        let mut stats = SyncStats::default();
        let mut received: Vec<(String, String)> = Vec::new();
        let mut deletes: Vec<String> = Vec::new();

        for action in actions {
            match action {
                Action::Download { path } => match channel.reader.read_message()? {
                    Message::FileData(header) => {
                        if header.path != *path {
                            bail!("out-of-order transfer: {} instead of {path}", header.path);
                        }
                        if self.receive_file(channel, &header)? {
                            stats.transferred += 1;
                            received.push((header.path.clone(), header.hash.clone()));
                        } else {
                            stats.failed += 1;
                        }
                    }
                    Message::Error(message) => {
                        warn!("server skipped {path}: {message}");
                        stats.failed += 1;
                    }
                    other => bail!("expected file data, got {}", other.token()),
                },
                Action::DeleteLocal { path, .. } => match channel.reader.read_message()? {
                    Message::DeleteFile(request) => {
                        if request.path != *path {
                            bail!("out-of-order delete: {} instead of {path}", request.path);
                        }
                        if self.apply_local_delete(&request)? {
                            channel.writer.send_ok()?;
                            stats.deleted += 1;
                            deletes.push(path.clone());
                        } else {
                            channel
                                .writer
                                .send_error(&format!("version regression for {path}"))?;
                            stats.failed += 1;
                        }
                    }
                    Message::Error(message) => {
                        warn!("server skipped delete of {path}: {message}");
                        stats.failed += 1;
                    }
                    other => bail!("expected delete, got {}", other.token()),
                },
                Action::AdoptVersion { path, version } => {
                    if let Some(entry) = self.state.files.get_mut(path) {
                        entry.version = *version;
                    }
                    stats.adopted += 1;
                }
                // A pull plan never uploads
                _ => {}
            }
        }

        Ok((stats, session_digest(&received, &deletes)))
    }

    /// Returns `Ok(false)` when only this transfer failed
    fn receive_file(&mut self, channel: &mut Channel, header: &FileHeader) -> Result<bool> {
        if !is_valid_relative_path(&header.path) {
            channel.writer.send_error("invalid path")?;
            bail!("invalid download path: {:?}", header.path);
        }
        if header.chunks == 0 || header.chunks > 1_048_576 {
            channel.writer.send_error("implausible chunk count")?;
            return Ok(false);
        }

        channel.writer.send_ok()?;

        let mut temp = tempfile::NamedTempFile::new_in(&self.local_root)?;
        let mut received: u64 = 0;
        for _ in 0..header.chunks {
            match channel.reader.read_message()? {
                Message::FileChunk(body) => {
                    received += body.len() as u64;
                    if received <= header.size {
                        temp.write_all(&body)?;
                    }
                }
                other => bail!("expected body frame, got {}", other.token()),
            }
        }
        temp.flush()?;

        let digest = hash::file_digest(temp.path())?;
        if received != header.size || digest != header.hash {
            warn!(
                "discarding {}: got {received} bytes, digest {digest}",
                header.path
            );
            channel
                .writer
                .send_error(&format!("integrity check failed for {}", header.path))?;
            return Ok(false);
        }

        let dest = self.local_root.join(&header.path);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        temp.persist(&dest)
            .map_err(|e| eyre!("cannot place {}: {e}", header.path))?;

        self.state.files.insert(
            header.path.clone(),
            FileEntry {
                path: header.path.clone(),
                hash: header.hash.clone(),
                size: header.size,
                modified: header.modified,
                version: header.version,
                status: FileStatus::Active,
                deleted_at: None,
            },
        );

        debug!("received {} ({} bytes)", header.path, header.size);
        channel.writer.send_ok()?;
        Ok(true)
    }

    /// Returns `Ok(false)` when the server's version does not dominate
    fn apply_local_delete(&mut self, request: &DeleteRequest) -> Result<bool> {
        if !is_valid_relative_path(&request.path) {
            bail!("invalid delete path: {:?}", request.path);
        }

        let local_version = self.state.files.get(&request.path).map_or(0, |e| e.version);
        if request.version <= local_version {
            warn!(
                "refusing delete of {} (local v{local_version}, server v{})",
                request.path, request.version
            );
            return Ok(false);
        }

        match std::fs::remove_file(self.local_root.join(&request.path)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let now = Utc::now();
        let entry = match self.state.files.get(&request.path) {
            Some(existing) => existing.clone().into_tombstone(request.version, now),
            None => FileEntry {
                path: request.path.clone(),
                hash: String::new(),
                size: 0,
                modified: now,
                version: request.version,
                status: FileStatus::Deleted,
                deleted_at: Some(now),
            },
        };
        self.state.files.insert(request.path.clone(), entry);

        debug!("deleted {} (v{})", request.path, request.version);
        Ok(true)
    }
}
