//! Sync plan computation
//!
//! Given the two state documents and a direction, computes the transfers,
//! deletions, version adoptions, and conflicts for one session. Plan
//! computation is pure: equal inputs always yield equal plans.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::state::{FileEntry, SyncState};

/// Direction of a sync session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Client changes flow to the server
    Push,
    /// Server changes flow to the client
    Pull,
}

/// How a session resolves detected conflicts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStrategy {
    /// Surface the conflicts and abort with no state mutation
    Ask,
    /// The local side wins: upload/delete-remote on push, keep local on pull
    Local,
    /// The remote side wins: skip on push, download/delete-local on pull
    Remote,
    /// Drop the conflicting paths from the plan, touch neither side
    Skip,
}

/// Why a path conflicted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Both sides changed the content since the common base
    ConcurrentEdit,
    /// Deleted locally while the remote side modified it
    LocalDeleteRemoteEdit,
    /// Deleted remotely while the local side still holds or modified it
    RemoteDeleted,
}

/// A path both sides changed in incompatible ways
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    pub path: String,
    pub kind: ConflictKind,
    pub explanation: String,
    pub local_version: u64,
    pub remote_version: u64,
}

/// One operation in a sync plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    /// Send the local file to the remote side
    Upload { path: String },
    /// Fetch the remote file to the local side
    Download { path: String },
    /// Tombstone the path on the remote side
    DeleteRemote { path: String, version: u64 },
    /// Remove the path locally and tombstone it
    DeleteLocal { path: String, version: u64 },
    /// Same content, diverged counters: adopt the higher version, no transfer
    AdoptVersion { path: String, version: u64 },
}

impl Action {
    #[must_use]
    pub fn path(&self) -> &str {
        match self {
            Self::Upload { path }
            | Self::Download { path }
            | Self::DeleteRemote { path, .. }
            | Self::DeleteLocal { path, .. }
            | Self::AdoptVersion { path, .. } => path,
        }
    }
}

/// The deterministic output of plan computation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPlan {
    pub actions: Vec<Action>,
    pub conflicts: Vec<Conflict>,
}

impl SyncPlan {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty() && self.conflicts.is_empty()
    }

    /// Count of actions that move file content
    #[must_use]
    pub fn transfer_count(&self) -> usize {
        self.actions
            .iter()
            .filter(|a| matches!(a, Action::Upload { .. } | Action::Download { .. }))
            .count()
    }

    /// Count of actions that delete on either side
    #[must_use]
    pub fn delete_count(&self) -> usize {
        self.actions
            .iter()
            .filter(|a| matches!(a, Action::DeleteRemote { .. } | Action::DeleteLocal { .. }))
            .count()
    }

    /// Apply a conflict strategy, turning conflicts into actions or dropping
    /// them. Under `ask` the conflicts stay for the driver to surface.
    #[must_use]
    pub fn resolve(mut self, strategy: ConflictStrategy, mode: SyncMode) -> Self {
        if self.conflicts.is_empty() || strategy == ConflictStrategy::Ask {
            return self;
        }

        let conflicts = std::mem::take(&mut self.conflicts);
        for conflict in conflicts {
            let forced = match (strategy, mode) {
                (ConflictStrategy::Skip, _) => None,
                // Local wins on pull / remote wins on push: leave both sides be
                (ConflictStrategy::Local, SyncMode::Pull)
                | (ConflictStrategy::Remote, SyncMode::Push) => None,
                (ConflictStrategy::Local, SyncMode::Push) => Some(match conflict.kind {
                    ConflictKind::ConcurrentEdit | ConflictKind::RemoteDeleted => Action::Upload {
                        path: conflict.path,
                    },
                    ConflictKind::LocalDeleteRemoteEdit => Action::DeleteRemote {
                        path: conflict.path,
                        // Must dominate the remote entry to survive commit
                        version: conflict.local_version.max(conflict.remote_version + 1),
                    },
                }),
                (ConflictStrategy::Remote, SyncMode::Pull) => Some(match conflict.kind {
                    ConflictKind::ConcurrentEdit | ConflictKind::LocalDeleteRemoteEdit => {
                        Action::Download {
                            path: conflict.path,
                        }
                    }
                    ConflictKind::RemoteDeleted => Action::DeleteLocal {
                        path: conflict.path,
                        version: conflict.remote_version.max(conflict.local_version + 1),
                    },
                }),
                (ConflictStrategy::Ask, _) => unreachable!("handled above"),
            };

            if let Some(action) = forced {
                self.actions.push(action);
            }
        }

        self
    }
}

fn conflict(path: &str, kind: ConflictKind, local: u64, remote: u64) -> Conflict {
    let explanation = match kind {
        ConflictKind::ConcurrentEdit => {
            format!("both sides modified (local v{local}, remote v{remote})")
        }
        ConflictKind::LocalDeleteRemoteEdit => {
            format!("deleted locally at v{local} but changed remotely at v{remote}")
        }
        ConflictKind::RemoteDeleted => {
            format!("deleted remotely at v{remote} but held locally at v{local}")
        }
    };
    Conflict {
        path: path.to_string(),
        kind,
        explanation,
        local_version: local,
        remote_version: remote,
    }
}

/// Compute the plan for one session.
///
/// `local` is the initiating client's document, `remote` the server's.
/// "Diverged" means other commits may have landed since the client's last
/// successful session (`local.base_version < remote.sync_version`).
#[must_use]
pub fn compute_plan(local: &SyncState, remote: &SyncState, mode: SyncMode) -> SyncPlan {
    let diverged = local.base_version < remote.sync_version;
    let mut plan = SyncPlan::default();

    let paths: BTreeSet<&String> = local.files.keys().chain(remote.files.keys()).collect();

    for path in paths {
        let l = local.files.get(path.as_str());
        let r = remote.files.get(path.as_str());
        match mode {
            SyncMode::Push => plan_push(&mut plan, path, l, r, diverged),
            SyncMode::Pull => plan_pull(&mut plan, path, l, r, diverged),
        }
    }

    plan
}

fn plan_push(
    plan: &mut SyncPlan,
    path: &str,
    local: Option<&FileEntry>,
    remote: Option<&FileEntry>,
    diverged: bool,
) {
    match (local, remote) {
        (Some(l), None) if l.is_active() => {
            plan.actions.push(Action::Upload {
                path: path.to_string(),
            });
        }
        (Some(l), Some(r)) if l.is_active() && r.is_active() => {
            if l.hash == r.hash {
                if l.version != r.version {
                    plan.actions.push(Action::AdoptVersion {
                        path: path.to_string(),
                        version: l.version.max(r.version),
                    });
                }
            } else if l.version > r.version || !diverged {
                plan.actions.push(Action::Upload {
                    path: path.to_string(),
                });
            } else {
                plan.conflicts.push(conflict(
                    path,
                    ConflictKind::ConcurrentEdit,
                    l.version,
                    r.version,
                ));
            }
        }
        (Some(l), Some(r)) if l.is_deleted() && r.is_active() => {
            if l.version > r.version {
                plan.actions.push(Action::DeleteRemote {
                    path: path.to_string(),
                    version: l.version,
                });
            } else {
                plan.conflicts.push(conflict(
                    path,
                    ConflictKind::LocalDeleteRemoteEdit,
                    l.version,
                    r.version,
                ));
            }
        }
        (Some(l), Some(r)) if l.is_active() && r.is_deleted() => {
            if l.version > r.version {
                // Resurrect the remote path
                plan.actions.push(Action::Upload {
                    path: path.to_string(),
                });
            } else {
                plan.conflicts.push(conflict(
                    path,
                    ConflictKind::RemoteDeleted,
                    l.version,
                    r.version,
                ));
            }
        }
        (Some(l), Some(r)) => {
            // Both tombstoned: keep the counters in step
            if l.version != r.version {
                plan.actions.push(Action::AdoptVersion {
                    path: path.to_string(),
                    version: l.version.max(r.version),
                });
            }
        }
        // A push never downloads or deletes locally; a lone local tombstone
        // has nothing remote to act on
        (Some(_), None) | (None, Some(_)) | (None, None) => {}
    }
}

fn plan_pull(
    plan: &mut SyncPlan,
    path: &str,
    local: Option<&FileEntry>,
    remote: Option<&FileEntry>,
    diverged: bool,
) {
    match (local, remote) {
        (None, Some(r)) if r.is_active() => {
            plan.actions.push(Action::Download {
                path: path.to_string(),
            });
        }
        (Some(l), Some(r)) if l.is_active() && r.is_active() => {
            if l.hash == r.hash {
                if l.version != r.version {
                    plan.actions.push(Action::AdoptVersion {
                        path: path.to_string(),
                        version: l.version.max(r.version),
                    });
                }
            } else if r.version > l.version || !diverged {
                plan.actions.push(Action::Download {
                    path: path.to_string(),
                });
            } else {
                plan.conflicts.push(conflict(
                    path,
                    ConflictKind::ConcurrentEdit,
                    l.version,
                    r.version,
                ));
            }
        }
        (Some(l), Some(r)) if l.is_active() && r.is_deleted() => {
            if r.version > l.version {
                plan.actions.push(Action::DeleteLocal {
                    path: path.to_string(),
                    version: r.version,
                });
            } else {
                plan.conflicts.push(conflict(
                    path,
                    ConflictKind::RemoteDeleted,
                    l.version,
                    r.version,
                ));
            }
        }
        (Some(l), Some(r)) if l.is_deleted() && r.is_active() => {
            if r.version > l.version {
                // The remote side changed it after our delete: take it back
                plan.actions.push(Action::Download {
                    path: path.to_string(),
                });
            } else {
                plan.conflicts.push(conflict(
                    path,
                    ConflictKind::LocalDeleteRemoteEdit,
                    l.version,
                    r.version,
                ));
            }
        }
        (Some(l), Some(r)) => {
            if l.version != r.version {
                plan.actions.push(Action::AdoptVersion {
                    path: path.to_string(),
                    version: l.version.max(r.version),
                });
            }
        }
        // A pull never uploads; unknown remote tombstones are irrelevant
        (Some(_), None) | (None, Some(_)) | (None, None) => {}
    }
}
