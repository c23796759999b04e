//! Per-connection session handling
//!
//! One session per accepted connection. The session owns its connection,
//! codec, staging area, and negotiated plan. Uploaded files land in a
//! session-private staging directory inside the data root and only move into
//! place during the commit critical section; dropping the session discards
//! anything not committed.

use std::io::{BufReader, BufWriter, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use color_eyre::eyre::{bail, eyre};
use color_eyre::Result;
use tempfile::TempDir;
use tracing::{debug, info, warn};

use dirsync_core::frame::FrameCodec;
use dirsync_core::hash;
use dirsync_core::plan::{compute_plan, Action, ConflictStrategy, SyncMode, SyncPlan};
use dirsync_core::protocol::{
    chunk_count, session_digest, CompleteReply, ConflictReply, DeleteRequest, FileHeader, Hello,
    HelloReply, Message, PlanReply, ProtocolReader, ProtocolWriter, SyncComplete, SyncRequest,
    PROTOCOL_VERSION,
};
use dirsync_core::scan::is_valid_relative_path;
use dirsync_core::state::{FileEntry, FileStatus, SyncState};

use crate::ServerCtx;

/// An upload that passed verification and awaits commit
struct StagedUpload {
    header: FileHeader,
    temp_path: PathBuf,
}

struct Session {
    ctx: Arc<ServerCtx>,
    reader: ProtocolReader<BufReader<TcpStream>>,
    writer: ProtocolWriter<BufWriter<TcpStream>>,
    client_id: Option<String>,
    mode: Option<SyncMode>,
    plan: Option<SyncPlan>,
    staging: Option<TempDir>,
    staged: Vec<StagedUpload>,
    deletes: Vec<DeleteRequest>,
    /// Pull-mode ledger of what the client acknowledged: `(path, hash)` per
    /// delivered file, plus deleted paths. Checked against the client's
    /// completion digest.
    sent: Vec<(String, String)>,
    sent_deletes: Vec<String>,
}

/// Drive one connection to completion
///
/// # Errors
/// Returns an error for protocol violations; a plain disconnect is clean
pub fn handle_connection(stream: TcpStream, ctx: Arc<ServerCtx>) -> Result<()> {
    stream.set_read_timeout(Some(ctx.idle_timeout))?;
    stream.set_nodelay(true)?;

    let codec = match &ctx.cipher {
        Some(cipher) => FrameCodec::encrypted(cipher.clone()),
        None => FrameCodec::plaintext(),
    };
    let compression = ctx.compression;

    let reader = ProtocolReader::new(BufReader::new(stream.try_clone()?), codec.clone());
    let writer = ProtocolWriter::new(BufWriter::new(stream), codec, compression);

    let mut session = Session {
        ctx,
        reader,
        writer,
        client_id: None,
        mode: None,
        plan: None,
        staging: None,
        staged: Vec::new(),
        deletes: Vec::new(),
        sent: Vec::new(),
        sent_deletes: Vec::new(),
    };

    let outcome = session.serve();
    if let Err(e) = &outcome {
        // Best effort: tell the peer why before closing
        let _ = session.writer.send_error(&e.to_string());
    }
    outcome
}

/// True when the error is just the peer hanging up
fn is_disconnect(err: &color_eyre::Report) -> bool {
    err.downcast_ref::<std::io::Error>()
        .is_some_and(|io| io.kind() == std::io::ErrorKind::UnexpectedEof)
}

impl Session {
    fn serve(&mut self) -> Result<()> {
        loop {
            let message = match self.reader.read_message() {
                Ok(message) => message,
                Err(e) if is_disconnect(&e) => return Ok(()),
                Err(e) => return Err(e),
            };

            match message {
                Message::Hello(hello) => self.on_hello(hello)?,
                _ if self.client_id.is_none() => {
                    self.writer.send_error("handshake required")?;
                    bail!("command before HELLO");
                }
                Message::GetState => self.on_get_state()?,
                Message::SyncRequest(request) => self.on_sync_request(request)?,
                Message::FileData(header) => self.on_file_data(header)?,
                Message::DeleteFile(request) => self.on_delete_file(request)?,
                Message::SyncComplete(complete) => self.on_sync_complete(&complete)?,
                other => {
                    self.writer
                        .send_error(&format!("unexpected command: {}", other.token()))?;
                    bail!("unexpected command: {}", other.token());
                }
            }
        }
    }

    fn on_hello(&mut self, hello: Hello) -> Result<()> {
        if hello.protocol_version != PROTOCOL_VERSION {
            self.writer.send_error(&format!(
                "unsupported protocol version {} (want {PROTOCOL_VERSION})",
                hello.protocol_version
            ))?;
            bail!("protocol version mismatch");
        }

        let server_version = self.ctx.lock_state().sync_version;
        info!("handshake from {}", hello.client_id);
        self.client_id = Some(hello.client_id);
        self.writer.send_ok_payload(&HelloReply {
            server_version,
            protocol_version: PROTOCOL_VERSION,
        })
    }

    fn on_get_state(&mut self) -> Result<()> {
        let snapshot = self.ctx.snapshot()?;
        debug!(
            "state requested: {} entries, sync_version {}",
            snapshot.files.len(),
            snapshot.sync_version
        );
        self.writer.send_state_reply(&snapshot)
    }

    fn on_sync_request(&mut self, request: SyncRequest) -> Result<()> {
        let snapshot = self.ctx.snapshot()?;
        let client = self.client_id.as_deref().unwrap_or("?");
        info!(
            "sync request from {client}: mode {:?}, base {}, {} entries (server at {})",
            request.mode,
            request.base_version,
            request.local_state.files.len(),
            snapshot.sync_version
        );

        let raw = compute_plan(&request.local_state, &snapshot, request.mode);
        if !raw.conflicts.is_empty() && request.strategy == ConflictStrategy::Ask {
            info!("{} conflict(s), aborting without mutation", raw.conflicts.len());
            self.mode = None;
            self.plan = None;
            return self.writer.send_conflict(&ConflictReply {
                server_version: snapshot.sync_version,
                conflicts: raw.conflicts,
            });
        }

        let plan = raw.resolve(request.strategy, request.mode);
        info!(
            "plan: {} transfer(s), {} delete(s)",
            plan.transfer_count(),
            plan.delete_count()
        );

        self.mode = Some(request.mode);
        self.plan = Some(plan.clone());
        self.staged.clear();
        self.deletes.clear();
        self.sent.clear();
        self.sent_deletes.clear();
        self.staging = match request.mode {
            SyncMode::Push => Some(
                tempfile::Builder::new()
                    .prefix(".stage-")
                    .tempdir_in(&self.ctx.data_root)?,
            ),
            SyncMode::Pull => None,
        };

        self.writer.send_ok_payload(&PlanReply {
            server_version: snapshot.sync_version,
            plan: plan.clone(),
        })?;

        if request.mode == SyncMode::Pull {
            self.stream_pull(&plan, &snapshot)?;
        }
        Ok(())
    }

    /// Send planned downloads and deletions to the client, in plan order
    fn stream_pull(&mut self, plan: &SyncPlan, snapshot: &SyncState) -> Result<()> {
        for action in &plan.actions {
            match action {
                Action::Download { path } => {
                    let Some(entry) = snapshot.files.get(path).filter(|e| e.is_active()) else {
                        self.writer.send_error(&format!("not on server: {path}"))?;
                        continue;
                    };

                    let data = match std::fs::read(self.ctx.data_root.join(path)) {
                        Ok(data) => data,
                        Err(e) => {
                            warn!("cannot read {path}: {e}");
                            self.writer.send_error(&format!("cannot read {path}: {e}"))?;
                            continue;
                        }
                    };

                    if let Some(digest) = self.send_file(path, &data, entry)? {
                        self.sent.push((path.clone(), digest));
                    }
                }
                Action::DeleteLocal { path, version } => {
                    self.writer.send_delete_file(&DeleteRequest {
                        path: path.clone(),
                        version: *version,
                    })?;
                    if self.await_transfer_ack(path)? {
                        self.sent_deletes.push(path.clone());
                    }
                }
                // Adoptions are the client's bookkeeping; uploads and remote
                // deletes never appear in a pull plan
                _ => {}
            }
        }
        Ok(())
    }

    /// Returns the delivered content hash, or `None` if the client refused
    fn send_file(&mut self, path: &str, data: &[u8], entry: &FileEntry) -> Result<Option<String>> {
        // Hash what is actually on disk right now; the client verifies
        // against the header, not against the possibly-stale plan entry
        let digest = hash::bytes_digest(data);
        let chunks = chunk_count(data.len() as u64, self.ctx.chunk_size);

        self.writer.send_file_header(&FileHeader {
            path: path.to_string(),
            size: data.len() as u64,
            hash: digest.clone(),
            version: entry.version,
            modified: entry.modified,
            chunks,
        })?;

        match self.reader.read_message()? {
            Message::Ok(_) => {}
            Message::Error(message) => {
                warn!("client refused {path}: {message}");
                return Ok(None);
            }
            other => bail!("expected transfer ack, got {}", other.token()),
        }

        if chunks == 1 {
            self.writer.send_file_chunk(data)?;
        } else {
            for chunk in data.chunks(self.ctx.chunk_size as usize) {
                self.writer.send_file_chunk(chunk)?;
            }
        }

        Ok(self.await_transfer_ack(path)?.then_some(digest))
    }

    /// Returns whether the peer acknowledged the operation
    fn await_transfer_ack(&mut self, path: &str) -> Result<bool> {
        match self.reader.read_message()? {
            Message::Ok(_) => Ok(true),
            Message::Error(message) => {
                warn!("client rejected {path}: {message}");
                Ok(false)
            }
            other => bail!("expected transfer ack, got {}", other.token()),
        }
    }

    /// Receive one planned upload into the staging directory
    fn on_file_data(&mut self, header: FileHeader) -> Result<()> {
        if self.mode != Some(SyncMode::Push) {
            self.writer.send_error("no push session negotiated")?;
            bail!("FILE_DATA outside a push session");
        }
        if !is_valid_relative_path(&header.path) {
            self.writer.send_error("invalid path")?;
            bail!("invalid upload path: {:?}", header.path);
        }
        let planned = self.plan.as_ref().is_some_and(|p| {
            p.actions
                .iter()
                .any(|a| matches!(a, Action::Upload { path } if *path == header.path))
        });
        if !planned {
            self.writer.send_error(&format!("not in plan: {}", header.path))?;
            return Ok(());
        }
        if header.chunks == 0 || header.chunks > 1_048_576 {
            self.writer.send_error("implausible chunk count")?;
            bail!("implausible chunk count for {}", header.path);
        }

        // Accept, then consume exactly `chunks` body frames
        self.writer.send_ok()?;

        let staging = self
            .staging
            .as_ref()
            .ok_or_else(|| eyre!("staging dir missing"))?;
        let temp_path = staging.path().join(format!("upload-{:04}", self.staged.len()));
        let mut file = std::fs::File::create(&temp_path)?;
        let mut received: u64 = 0;
        let mut oversized = false;

        for _ in 0..header.chunks {
            match self.reader.read_message()? {
                Message::FileChunk(body) => {
                    received += body.len() as u64;
                    if received > header.size {
                        oversized = true;
                    } else {
                        file.write_all(&body)?;
                    }
                }
                other => bail!("expected body frame, got {}", other.token()),
            }
        }
        file.flush()?;
        drop(file);

        if oversized || received != header.size {
            let _ = std::fs::remove_file(&temp_path);
            warn!(
                "size mismatch for {}: declared {}, received {received}",
                header.path, header.size
            );
            return self
                .writer
                .send_error(&format!("size mismatch for {}", header.path));
        }

        let digest = hash::file_digest(&temp_path)?;
        if digest != header.hash {
            let _ = std::fs::remove_file(&temp_path);
            warn!("hash mismatch for {}", header.path);
            return self
                .writer
                .send_error(&format!("hash mismatch for {}", header.path));
        }

        debug!("staged {} ({} bytes, v{})", header.path, header.size, header.version);
        self.staged.push(StagedUpload { header, temp_path });
        self.writer.send_ok()
    }

    fn on_delete_file(&mut self, request: DeleteRequest) -> Result<()> {
        if self.mode != Some(SyncMode::Push) {
            self.writer.send_error("no push session negotiated")?;
            bail!("DELETE_FILE outside a push session");
        }
        if !is_valid_relative_path(&request.path) {
            self.writer.send_error("invalid path")?;
            bail!("invalid delete path: {:?}", request.path);
        }
        let planned = self.plan.as_ref().is_some_and(|p| {
            p.actions
                .iter()
                .any(|a| matches!(a, Action::DeleteRemote { path, .. } if *path == request.path))
        });
        if !planned {
            self.writer
                .send_error(&format!("not in plan: {}", request.path))?;
            return Ok(());
        }

        debug!("delete queued: {} (v{})", request.path, request.version);
        self.deletes.push(request);
        self.writer.send_ok()
    }

    /// Commit: the single critical section that mutates the authoritative
    /// state and bumps the global version
    fn on_sync_complete(&mut self, complete: &SyncComplete) -> Result<()> {
        let Some(mode) = self.mode else {
            self.writer.send_error("no session negotiated")?;
            bail!("SYNC_COMPLETE outside a session");
        };

        debug!(
            "completion: {} uploaded, {} deleted",
            complete.uploaded, complete.deleted
        );

        if mode == SyncMode::Pull {
            // The client's ledger must match what it acknowledged receiving
            let expected = session_digest(&self.sent, &self.sent_deletes);
            if complete.new_state_digest != expected {
                self.writer.send_error("session digest mismatch")?;
                self.end_session();
                bail!("pull completion digest mismatch");
            }

            let new_sync_version = self.ctx.lock_state().sync_version;
            self.end_session();
            return self.writer.send_ok_payload(&CompleteReply { new_sync_version });
        }

        // Take ownership of the session's staged work; the staging dir must
        // outlive the renames below
        let staged = std::mem::take(&mut self.staged);
        let deletes = std::mem::take(&mut self.deletes);
        let staging = self.staging.take();
        self.mode = None;
        self.plan = None;

        // Both sides must agree on exactly which operations this session
        // performed before anything is committed
        let upload_pairs: Vec<(String, String)> = staged
            .iter()
            .map(|u| (u.header.path.clone(), u.header.hash.clone()))
            .collect();
        let delete_paths: Vec<String> = deletes.iter().map(|d| d.path.clone()).collect();
        let expected = session_digest(&upload_pairs, &delete_paths);
        if complete.new_state_digest != expected {
            self.writer.send_error("session digest mismatch")?;
            bail!("push completion digest mismatch");
        }

        let now = Utc::now();
        let mut state = self.ctx.lock_state();

        // Verify first, mutate second: a delete must dominate whatever is
        // live now, tombstone included (another client may have committed a
        // later version of this path meanwhile)
        let regression = deletes.iter().find_map(|delete| {
            state.files.get(&delete.path).and_then(|existing| {
                (delete.version <= existing.version)
                    .then(|| (delete.path.clone(), existing.version, delete.version))
            })
        });
        if let Some((path, live, requested)) = regression {
            drop(state);
            self.writer.send_error(&format!(
                "version regression deleting {path} (live v{live} >= v{requested})"
            ))?;
            bail!("commit rejected: version regression on {path}");
        }

        let rollback = state.clone();
        let mut touched_max: u64 = 0;

        for upload in &staged {
            let existing_version = state
                .files
                .get(&upload.header.path)
                .map_or(0, |e| e.version);
            let version = if upload.header.version > existing_version {
                upload.header.version
            } else {
                existing_version + 1
            };
            touched_max = touched_max.max(version);

            let dest = self.ctx.data_root.join(&upload.header.path);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            if let Err(e) = std::fs::rename(&upload.temp_path, &dest) {
                *state = rollback.clone();
                drop(state);
                self.writer
                    .send_error(&format!("cannot place {}: {e}", upload.header.path))?;
                bail!("commit failed placing {}: {e}", upload.header.path);
            }

            state.files.insert(
                upload.header.path.clone(),
                FileEntry {
                    path: upload.header.path.clone(),
                    hash: upload.header.hash.clone(),
                    size: upload.header.size,
                    modified: upload.header.modified,
                    version,
                    status: FileStatus::Active,
                    deleted_at: None,
                },
            );
        }

        for delete in &deletes {
            touched_max = touched_max.max(delete.version);
            match std::fs::remove_file(self.ctx.data_root.join(&delete.path)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    *state = rollback.clone();
                    drop(state);
                    self.writer
                        .send_error(&format!("cannot delete {}: {e}", delete.path))?;
                    bail!("commit failed deleting {}: {e}", delete.path);
                }
            }

            let modified = state.files.get(&delete.path).map_or(now, |e| e.modified);
            state.files.insert(
                delete.path.clone(),
                FileEntry {
                    path: delete.path.clone(),
                    hash: String::new(),
                    size: 0,
                    modified,
                    version: delete.version,
                    status: FileStatus::Deleted,
                    deleted_at: Some(now),
                },
            );
        }

        let mutated = !staged.is_empty() || !deletes.is_empty();
        if mutated {
            state.sync_version = (state.sync_version + 1).max(touched_max);
            state.last_sync_time = Some(now);

            if let Err(e) = state.save(&self.ctx.state_path) {
                *state = rollback.clone();
                drop(state);
                self.writer.send_error("state persistence failed")?;
                bail!("commit failed persisting state: {e}");
            }
        }

        let new_sync_version = state.sync_version;
        drop(state);
        drop(staging);

        info!(
            "committed {} upload(s), {} delete(s); sync_version {}",
            staged.len(),
            deletes.len(),
            new_sync_version
        );
        self.writer.send_ok_payload(&CompleteReply { new_sync_version })
    }

    fn end_session(&mut self) {
        self.mode = None;
        self.plan = None;
        self.staged.clear();
        self.deletes.clear();
        self.sent.clear();
        self.sent_deletes.clear();
        self.staging = None;
    }
}
