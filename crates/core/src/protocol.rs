//! Typed command protocol over the frame codec
//!
//! A session is one bidirectional framed stream. Command tokens travel in the
//! frame's `cmd` field; payloads are UTF-8 JSON except `FILE_CHUNK`, whose
//! payload is a raw body wrapped in the compression envelope. `SYNC_REQUEST`
//! payloads and `GET_STATE` replies carry whole state documents and travel
//! enveloped too.

use std::io::{Read, Write};

use chrono::{DateTime, Utc};
use color_eyre::eyre::eyre;
use color_eyre::Result;
use md5::{Digest, Md5};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::envelope;
use crate::frame::FrameCodec;
use crate::plan::{Conflict, ConflictStrategy, SyncMode, SyncPlan};
use crate::state::SyncState;

/// Wire protocol version, negotiated in `HELLO`
pub const PROTOCOL_VERSION: u32 = 2;

/// Files at or below this size travel as a single body chunk
pub const WHOLE_FILE_LIMIT: u64 = 1024 * 1024;

/// Command tokens
pub mod cmd {
    pub const HELLO: &str = "HELLO";
    pub const OK: &str = "OK";
    pub const ERROR: &str = "ERROR";
    pub const CONFLICT: &str = "CONFLICT";
    pub const GET_STATE: &str = "GET_STATE";
    pub const SYNC_REQUEST: &str = "SYNC_REQUEST";
    pub const FILE_DATA: &str = "FILE_DATA";
    pub const FILE_CHUNK: &str = "FILE_CHUNK";
    pub const DELETE_FILE: &str = "DELETE_FILE";
    pub const SYNC_COMPLETE: &str = "SYNC_COMPLETE";
}

/// `HELLO` payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    pub client_id: String,
    pub protocol_version: u32,
}

/// `OK` payload answering `HELLO`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloReply {
    pub server_version: u64,
    pub protocol_version: u32,
}

/// `SYNC_REQUEST` payload (enveloped on the wire)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequest {
    pub mode: SyncMode,
    pub base_version: u64,
    pub strategy: ConflictStrategy,
    pub local_state: SyncState,
}

/// `OK` payload answering `SYNC_REQUEST`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanReply {
    pub server_version: u64,
    pub plan: SyncPlan,
}

/// `CONFLICT` payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictReply {
    pub server_version: u64,
    pub conflicts: Vec<Conflict>,
}

/// `OK` payload answering `GET_STATE` (enveloped on the wire)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateReply {
    pub state: SyncState,
}

/// `FILE_DATA` header; `chunks` body frames follow after the receiver ACKs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileHeader {
    pub path: String,
    pub size: u64,
    pub hash: String,
    pub version: u64,
    pub modified: DateTime<Utc>,
    pub chunks: u32,
}

/// `DELETE_FILE` payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub path: String,
    pub version: u64,
}

/// `SYNC_COMPLETE` payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncComplete {
    pub uploaded: u32,
    pub deleted: u32,
    /// [`session_digest`] over the operations this side applied; the
    /// receiver recomputes it from its own ledger and refuses to commit on
    /// a mismatch
    pub new_state_digest: String,
}

/// `OK` payload answering `SYNC_COMPLETE`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteReply {
    pub new_sync_version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ErrorReply {
    message: String,
}

/// A decoded incoming frame
#[derive(Debug)]
pub enum Message {
    Hello(Hello),
    /// Raw payload; its JSON shape depends on what it acknowledges
    Ok(Vec<u8>),
    Error(String),
    Conflict(ConflictReply),
    GetState,
    SyncRequest(SyncRequest),
    FileData(FileHeader),
    /// Body bytes, envelope already removed
    FileChunk(Vec<u8>),
    DeleteFile(DeleteRequest),
    SyncComplete(SyncComplete),
}

impl Message {
    /// Short token for logging
    #[must_use]
    pub fn token(&self) -> &'static str {
        match self {
            Self::Hello(_) => cmd::HELLO,
            Self::Ok(_) => cmd::OK,
            Self::Error(_) => cmd::ERROR,
            Self::Conflict(_) => cmd::CONFLICT,
            Self::GetState => cmd::GET_STATE,
            Self::SyncRequest(_) => cmd::SYNC_REQUEST,
            Self::FileData(_) => cmd::FILE_DATA,
            Self::FileChunk(_) => cmd::FILE_CHUNK,
            Self::DeleteFile(_) => cmd::DELETE_FILE,
            Self::SyncComplete(_) => cmd::SYNC_COMPLETE,
        }
    }
}

/// Parse a JSON payload from an `OK` frame
///
/// # Errors
/// Returns an error if the payload does not match the expected shape
pub fn parse_reply<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload).map_err(|e| eyre!("malformed reply payload: {e}"))
}

/// Writing half of a session
pub struct ProtocolWriter<W> {
    inner: W,
    codec: FrameCodec,
    compress: bool,
}

impl<W: Write> ProtocolWriter<W> {
    #[must_use]
    pub fn new(inner: W, codec: FrameCodec, compress: bool) -> Self {
        Self {
            inner,
            codec,
            compress,
        }
    }

    fn send_json<T: Serialize>(&mut self, token: &str, payload: &T) -> Result<()> {
        let json = serde_json::to_vec(payload)?;
        self.codec.write_frame(&mut self.inner, token, &json)
    }

    /// Send a JSON payload wrapped in the compression envelope
    fn send_enveloped<T: Serialize>(&mut self, token: &str, payload: &T) -> Result<()> {
        let json = serde_json::to_vec(payload)?;
        let packed = envelope::pack(&json, self.compress)?;
        self.codec.write_frame(&mut self.inner, token, &packed)
    }

    pub fn send_hello(&mut self, hello: &Hello) -> Result<()> {
        self.send_json(cmd::HELLO, hello)
    }

    pub fn send_ok(&mut self) -> Result<()> {
        self.codec.write_frame(&mut self.inner, cmd::OK, b"")
    }

    pub fn send_ok_payload<T: Serialize>(&mut self, payload: &T) -> Result<()> {
        self.send_json(cmd::OK, payload)
    }

    /// Reply to `GET_STATE` with the enveloped server document
    pub fn send_state_reply(&mut self, state: &SyncState) -> Result<()> {
        self.send_enveloped(
            cmd::OK,
            &StateReply {
                state: state.clone(),
            },
        )
    }

    pub fn send_error(&mut self, message: &str) -> Result<()> {
        self.send_json(
            cmd::ERROR,
            &ErrorReply {
                message: message.to_string(),
            },
        )
    }

    pub fn send_conflict(&mut self, reply: &ConflictReply) -> Result<()> {
        self.send_json(cmd::CONFLICT, reply)
    }

    pub fn send_get_state(&mut self) -> Result<()> {
        self.codec.write_frame(&mut self.inner, cmd::GET_STATE, b"")
    }

    pub fn send_sync_request(&mut self, request: &SyncRequest) -> Result<()> {
        self.send_enveloped(cmd::SYNC_REQUEST, request)
    }

    pub fn send_file_header(&mut self, header: &FileHeader) -> Result<()> {
        self.send_json(cmd::FILE_DATA, header)
    }

    pub fn send_file_chunk(&mut self, body: &[u8]) -> Result<()> {
        let packed = envelope::pack(body, self.compress)?;
        self.codec.write_frame(&mut self.inner, cmd::FILE_CHUNK, &packed)
    }

    pub fn send_delete_file(&mut self, request: &DeleteRequest) -> Result<()> {
        self.send_json(cmd::DELETE_FILE, request)
    }

    pub fn send_sync_complete(&mut self, complete: &SyncComplete) -> Result<()> {
        self.send_json(cmd::SYNC_COMPLETE, complete)
    }
}

/// Reading half of a session
pub struct ProtocolReader<R> {
    inner: R,
    codec: FrameCodec,
}

impl<R: Read> ProtocolReader<R> {
    #[must_use]
    pub fn new(inner: R, codec: FrameCodec) -> Self {
        Self { inner, codec }
    }

    /// Read and decode the next message
    ///
    /// # Errors
    /// Returns an error on disconnect, auth failure, or an unknown command
    pub fn read_message(&mut self) -> Result<Message> {
        let (token, data) = self.codec.read_frame(&mut self.inner)?;

        match token.as_str() {
            cmd::HELLO => Ok(Message::Hello(serde_json::from_slice(&data)?)),
            cmd::OK => Ok(Message::Ok(data)),
            cmd::ERROR => {
                let message = serde_json::from_slice::<ErrorReply>(&data)
                    .map(|e| e.message)
                    .unwrap_or_else(|_| String::from_utf8_lossy(&data).into_owned());
                Ok(Message::Error(message))
            }
            cmd::CONFLICT => Ok(Message::Conflict(serde_json::from_slice(&data)?)),
            cmd::GET_STATE => Ok(Message::GetState),
            cmd::SYNC_REQUEST => {
                let json = envelope::unpack(&data)?;
                Ok(Message::SyncRequest(serde_json::from_slice(&json)?))
            }
            cmd::FILE_DATA => Ok(Message::FileData(serde_json::from_slice(&data)?)),
            cmd::FILE_CHUNK => Ok(Message::FileChunk(envelope::unpack(&data)?)),
            cmd::DELETE_FILE => Ok(Message::DeleteFile(serde_json::from_slice(&data)?)),
            cmd::SYNC_COMPLETE => Ok(Message::SyncComplete(serde_json::from_slice(&data)?)),
            other => Err(eyre!("unknown command: {other}")),
        }
    }

    /// Read the next message, requiring an `OK`; returns its payload
    ///
    /// # Errors
    /// Returns an error if the peer sent `ERROR` or anything unexpected
    pub fn read_ok(&mut self) -> Result<Vec<u8>> {
        match self.read_message()? {
            Message::Ok(payload) => Ok(payload),
            Message::Error(message) => Err(eyre!("peer error: {message}")),
            other => Err(eyre!("expected OK, got {}", other.token())),
        }
    }
}

/// Digest over one session's applied operations.
///
/// Both peers compute it the same way: every successful upload contributes
/// its path and content hash, every applied deletion its path, sorted so
/// transfer order does not matter. Equality means both sides agree on
/// exactly which operations the session performed.
#[must_use]
pub fn session_digest(uploads: &[(String, String)], deletes: &[String]) -> String {
    let mut items: Vec<String> = uploads
        .iter()
        .map(|(path, hash)| format!("U {path} {hash}"))
        .collect();
    items.extend(deletes.iter().map(|path| format!("D {path}")));
    items.sort();

    let mut hasher = Md5::new();
    for item in &items {
        hasher.update(item.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// Number of body chunks for a file of `size` bytes
#[must_use]
pub fn chunk_count(size: u64, chunk_size: u64) -> u32 {
    if size == 0 || size <= WHOLE_FILE_LIMIT {
        return 1;
    }
    u32::try_from(size.div_ceil(chunk_size)).unwrap_or(u32::MAX)
}
