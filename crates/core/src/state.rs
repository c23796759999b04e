//! Versioned sync state with tombstones
//!
//! One `FileEntry` per path ever observed. Deletions transition the entry to
//! a tombstone instead of removing it, so they propagate to peers. The whole
//! document persists as a single JSON file, replaced atomically.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::scan::ScannedFile;

/// `client_id` of the authoritative server record
pub const SERVER_CLIENT_ID: &str = "server";

/// State document filename under the server data root
pub const SERVER_STATE_FILE: &str = "server_sync_state.json";

/// State document filename under the client local root
pub const CLIENT_STATE_FILE: &str = "client_sync_state.json";

/// Whether a path currently exists or has been tombstoned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Active,
    Deleted,
}

/// One record per path ever observed under the sync root
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Relative path from the sync root, `/`-separated
    pub path: String,
    /// MD5 hex fingerprint; empty iff deleted
    pub hash: String,
    /// Byte length; 0 iff deleted
    pub size: u64,
    /// Wall-clock time of last content change
    pub modified: DateTime<Utc>,
    /// Per-path version, non-decreasing; bumped on content change and on
    /// the transition to deleted
    pub version: u64,
    pub status: FileStatus,
    /// Present iff deleted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl FileEntry {
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == FileStatus::Active
    }

    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.status == FileStatus::Deleted
    }

    /// Build the tombstone that replaces this entry when its path disappears
    #[must_use]
    pub fn into_tombstone(self, version: u64, now: DateTime<Utc>) -> Self {
        Self {
            hash: String::new(),
            size: 0,
            version,
            status: FileStatus::Deleted,
            deleted_at: Some(now),
            ..self
        }
    }
}

/// Paths that changed between the stored state and a fresh scan
#[derive(Debug, Default, Clone)]
pub struct ChangeSet {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub deleted: Vec<String>,
}

impl ChangeSet {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }
}

/// The persisted state document for one side of a sync relationship
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncState {
    /// Map of relative path -> entry (active files and tombstones)
    #[serde(default)]
    pub files: HashMap<String, FileEntry>,
    /// Server: highest version ever assigned. Client: mirror of the server's
    /// global version at the last successful session.
    #[serde(default)]
    pub sync_version: u64,
    /// Client only: server `sync_version` observed at the end of the last
    /// successful sync. 0 and ignored on the server record.
    #[serde(default)]
    pub base_version: u64,
    pub client_id: String,
    #[serde(default)]
    pub last_sync_time: Option<DateTime<Utc>>,
}

impl SyncState {
    /// Create an empty state for the given identity
    #[must_use]
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            files: HashMap::new(),
            sync_version: 0,
            base_version: 0,
            client_id: client_id.into(),
            last_sync_time: None,
        }
    }

    /// Generate a stable short client identifier (8 hex chars)
    #[must_use]
    pub fn generate_client_id() -> String {
        format!("{:08x}", rand::random::<u32>())
    }

    /// Load a state document from disk.
    ///
    /// Returns `None` if the file is missing or malformed; callers substitute
    /// an empty state with a freshly generated identity.
    #[must_use]
    pub fn load(path: &Path) -> Option<Self> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("failed to read state file {}: {e}", path.display());
                return None;
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(state) => Some(state),
            Err(e) => {
                warn!("malformed state file {}: {e}", path.display());
                None
            }
        }
    }

    /// Persist the document atomically (sibling temp file, then rename)
    ///
    /// # Errors
    /// Returns an error if the temp file cannot be written or renamed.
    pub fn save(&self, path: &Path) -> Result<()> {
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => std::path::PathBuf::from("."),
        };
        std::fs::create_dir_all(&parent)?;

        let json = serde_json::to_vec_pretty(self)?;
        let tmp = tempfile::NamedTempFile::new_in(&parent)?;
        std::fs::write(tmp.path(), &json)?;
        tmp.persist(path)
            .map_err(|e| color_eyre::eyre::eyre!("failed to replace {}: {e}", path.display()))?;
        Ok(())
    }

    /// Fold a fresh scan into the state.
    ///
    /// Unchanged entries carry forward untouched; changed content bumps the
    /// version; new paths enter at version 1; vanished paths become
    /// tombstones with a bumped version; existing tombstones carry forward.
    pub fn reconcile(&mut self, scanned: Vec<ScannedFile>, now: DateTime<Utc>) -> ChangeSet {
        let mut changes = ChangeSet::default();
        let mut seen: std::collections::HashSet<String> = std::collections::HashSet::new();

        for file in scanned {
            seen.insert(file.path.clone());

            match self.files.get_mut(&file.path) {
                None => {
                    changes.added.push(file.path.clone());
                    self.files.insert(
                        file.path.clone(),
                        FileEntry {
                            path: file.path,
                            hash: file.hash,
                            size: file.size,
                            modified: file.modified,
                            version: 1,
                            status: FileStatus::Active,
                            deleted_at: None,
                        },
                    );
                }
                Some(entry) if entry.hash == file.hash => {
                    // Fingerprint unchanged: carry forward, no version bump
                }
                Some(entry) => {
                    // Content changed, or a tombstoned path reappeared
                    changes.modified.push(file.path.clone());
                    entry.hash = file.hash;
                    entry.size = file.size;
                    entry.modified = file.modified;
                    entry.version += 1;
                    entry.status = FileStatus::Active;
                    entry.deleted_at = None;
                }
            }
        }

        for (path, entry) in &mut self.files {
            if !seen.contains(path) && entry.is_active() {
                changes.deleted.push(path.clone());
                let version = entry.version + 1;
                *entry = entry.clone().into_tombstone(version, now);
            }
        }

        changes.added.sort();
        changes.modified.sort();
        changes.deleted.sort();
        changes
    }

    /// Number of active (non-tombstone) entries
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.files.values().filter(|e| e.is_active()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scanned(path: &str, content: &[u8]) -> ScannedFile {
        ScannedFile {
            path: path.to_string(),
            hash: crate::hash::bytes_digest(content),
            size: content.len() as u64,
            modified: Utc::now(),
        }
    }

    #[test]
    fn test_reconcile_new_file() {
        let mut state = SyncState::new("test");
        let changes = state.reconcile(vec![scanned("a.txt", b"hello")], Utc::now());

        assert_eq!(changes.added, vec!["a.txt"]);
        let entry = &state.files["a.txt"];
        assert_eq!(entry.version, 1);
        assert!(entry.is_active());
        assert_eq!(entry.hash, "5d41402abc4b2a76b9719d911017c592");
    }

    #[test]
    fn test_reconcile_unchanged_keeps_version() {
        let mut state = SyncState::new("test");
        state.reconcile(vec![scanned("a.txt", b"hello")], Utc::now());
        let changes = state.reconcile(vec![scanned("a.txt", b"hello")], Utc::now());

        assert!(changes.is_empty());
        assert_eq!(state.files["a.txt"].version, 1);
    }

    #[test]
    fn test_reconcile_modified_bumps_version() {
        let mut state = SyncState::new("test");
        state.reconcile(vec![scanned("a.txt", b"hello")], Utc::now());
        let changes = state.reconcile(vec![scanned("a.txt", b"hi")], Utc::now());

        assert_eq!(changes.modified, vec!["a.txt"]);
        assert_eq!(state.files["a.txt"].version, 2);
    }

    #[test]
    fn test_reconcile_deletion_leaves_tombstone() {
        let mut state = SyncState::new("test");
        state.reconcile(vec![scanned("a.txt", b"hello")], Utc::now());
        let changes = state.reconcile(vec![], Utc::now());

        assert_eq!(changes.deleted, vec!["a.txt"]);
        let entry = &state.files["a.txt"];
        assert!(entry.is_deleted());
        assert_eq!(entry.version, 2);
        assert_eq!(entry.hash, "");
        assert_eq!(entry.size, 0);
        assert!(entry.deleted_at.is_some());
    }

    #[test]
    fn test_tombstone_survives_rescan() {
        let mut state = SyncState::new("test");
        state.reconcile(vec![scanned("a.txt", b"hello")], Utc::now());
        state.reconcile(vec![], Utc::now());
        let changes = state.reconcile(vec![], Utc::now());

        assert!(changes.is_empty());
        assert_eq!(state.files["a.txt"].version, 2);
        assert!(state.files["a.txt"].is_deleted());
    }

    #[test]
    fn test_tombstoned_path_resurrects_with_bump() {
        let mut state = SyncState::new("test");
        state.reconcile(vec![scanned("a.txt", b"hello")], Utc::now());
        state.reconcile(vec![], Utc::now());
        let changes = state.reconcile(vec![scanned("a.txt", b"again")], Utc::now());

        assert_eq!(changes.modified, vec!["a.txt"]);
        let entry = &state.files["a.txt"];
        assert!(entry.is_active());
        assert_eq!(entry.version, 3);
        assert!(entry.deleted_at.is_none());
    }

    #[test]
    fn test_version_monotonic_over_edit_delete_cycles() {
        let mut state = SyncState::new("test");
        let mut last = 0;
        for round in 0..5u32 {
            state.reconcile(
                vec![scanned("a.txt", format!("content {round}").as_bytes())],
                Utc::now(),
            );
            let v = state.files["a.txt"].version;
            assert!(v > last);
            last = v;

            state.reconcile(vec![], Utc::now());
            let v = state.files["a.txt"].version;
            assert!(v > last);
            last = v;
        }
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let mut state = SyncState::new("roundtrip");
        state.reconcile(vec![scanned("a.txt", b"hello")], Utc::now());
        state.sync_version = 7;
        state.base_version = 7;
        state.save(&path).unwrap();

        let loaded = SyncState::load(&path).unwrap();
        assert_eq!(loaded.client_id, "roundtrip");
        assert_eq!(loaded.sync_version, 7);
        assert_eq!(loaded.files.len(), 1);
        assert_eq!(loaded.files["a.txt"], state.files["a.txt"]);
    }

    #[test]
    fn test_load_missing_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(SyncState::load(&dir.path().join("absent.json")).is_none());
    }

    #[test]
    fn test_load_malformed_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"{ not json").unwrap();
        assert!(SyncState::load(&path).is_none());
    }

    #[test]
    fn test_generated_client_id_is_short_hex() {
        let id = SyncState::generate_client_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
