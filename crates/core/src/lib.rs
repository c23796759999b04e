//! dirsync-core: Core sync engine
//!
//! Provides the versioned state model, directory scanning and hashing, plan
//! computation with conflict detection, and the framed, encrypted transport
//! shared by the server and the client driver.

pub mod config;
pub mod crypto;
pub mod envelope;
pub mod frame;
pub mod hash;
pub mod plan;
pub mod protocol;
pub mod scan;
pub mod state;

pub use config::Config;
pub use crypto::Cipher;
pub use frame::FrameCodec;
pub use plan::{compute_plan, Action, Conflict, ConflictStrategy, SyncMode, SyncPlan};
pub use protocol::{Message, ProtocolReader, ProtocolWriter, PROTOCOL_VERSION};
pub use scan::{ScannedFile, Scanner};
pub use state::{FileEntry, FileStatus, SyncState};
