//! Three-way diff classification.
//!
//! Given the identity of a path on the local side, on the remote side, and
//! the identity both sides last agreed on (`synced`), [`classify`] decides
//! whether the path differs and how:
//!
//! | local | remote | synced | condition        | result                    |
//! |-------|--------|--------|------------------|---------------------------|
//! | L     | R      | none   | L == R           | no diff                   |
//! | L     | R      | none   | L != R           | `ConflictingCreate`       |
//! | L     | R      | S      | L == R           | no diff                   |
//! | L     | R      | S      | S == R           | `LocalUpdate`             |
//! | L     | R      | S      | S == L           | `RemoteUpdate`            |
//! | L     | R      | S      | otherwise        | `ConflictingUpdate`       |
//! | —     | R      | none   |                  | `RemoteCreate`            |
//! | —     | R      | S      | S == R           | `LocalRemove`             |
//! | —     | R      | S      | S != R           | `ConflictingLocalRemove`  |
//! | L     | —      | none   |                  | `LocalCreate`             |
//! | L     | —      | S      | S == L           | `RemoteRemove`            |
//! | L     | —      | S      | S != L           | `ConflictingRemoteRemove` |
//! | —     | —      | any    |                  | no diff                   |

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::identity::ContentIdentity;
use crate::metadata::EntrySyncMetadata;

/// How the local, remote and synced identities of a path relate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffKind {
    LocalCreate,
    LocalUpdate,
    LocalRemove,
    RemoteCreate,
    RemoteUpdate,
    RemoteRemove,
    ConflictingCreate,
    ConflictingUpdate,
    ConflictingLocalRemove,
    ConflictingRemoteRemove,
}

/// Which side a diff kind resolves toward without human input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffSide {
    Local,
    Remote,
    Conflict,
}

impl DiffKind {
    pub const ALL: [DiffKind; 10] = [
        DiffKind::LocalCreate,
        DiffKind::LocalUpdate,
        DiffKind::LocalRemove,
        DiffKind::RemoteCreate,
        DiffKind::RemoteUpdate,
        DiffKind::RemoteRemove,
        DiffKind::ConflictingCreate,
        DiffKind::ConflictingUpdate,
        DiffKind::ConflictingLocalRemove,
        DiffKind::ConflictingRemoteRemove,
    ];

    pub fn side(self) -> DiffSide {
        match self {
            Self::LocalCreate | Self::LocalUpdate | Self::LocalRemove => DiffSide::Local,
            Self::RemoteCreate | Self::RemoteUpdate | Self::RemoteRemove => DiffSide::Remote,
            Self::ConflictingCreate
            | Self::ConflictingUpdate
            | Self::ConflictingLocalRemove
            | Self::ConflictingRemoteRemove => DiffSide::Conflict,
        }
    }

    /// Conflicting kinds need an explicit `AcceptLocal`/`AcceptRemote`.
    pub fn is_conflicting(self) -> bool {
        self.side() == DiffSide::Conflict
    }

    /// Clean local kinds propagate local state to the remote side.
    pub fn is_clean_local(self) -> bool {
        self.side() == DiffSide::Local
    }

    /// Clean remote kinds propagate remote state to the local side.
    pub fn is_clean_remote(self) -> bool {
        self.side() == DiffSide::Remote
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::LocalCreate => "local_create",
            Self::LocalUpdate => "local_update",
            Self::LocalRemove => "local_remove",
            Self::RemoteCreate => "remote_create",
            Self::RemoteUpdate => "remote_update",
            Self::RemoteRemove => "remote_remove",
            Self::ConflictingCreate => "conflicting_create",
            Self::ConflictingUpdate => "conflicting_update",
            Self::ConflictingLocalRemove => "conflicting_local_remove",
            Self::ConflictingRemoteRemove => "conflicting_remote_remove",
        }
    }

    /// Inverse of [`as_str`](Self::as_str).
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.as_str() == name)
    }
}

impl fmt::Display for DiffKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify one path. `None` means the path does not differ.
pub fn classify(
    local: Option<&ContentIdentity>,
    remote: Option<&ContentIdentity>,
    synced: Option<&ContentIdentity>,
) -> Option<DiffKind> {
    match (local, remote, synced) {
        (Some(l), Some(r), _) if l == r => None,
        (Some(_), Some(_), None) => Some(DiffKind::ConflictingCreate),
        (Some(l), Some(r), Some(s)) => {
            if s == r {
                Some(DiffKind::LocalUpdate)
            } else if s == l {
                Some(DiffKind::RemoteUpdate)
            } else {
                Some(DiffKind::ConflictingUpdate)
            }
        }
        (None, Some(_), None) => Some(DiffKind::RemoteCreate),
        (None, Some(r), Some(s)) => {
            if s == r {
                Some(DiffKind::LocalRemove)
            } else {
                Some(DiffKind::ConflictingLocalRemove)
            }
        }
        (Some(_), None, None) => Some(DiffKind::LocalCreate),
        (Some(l), None, Some(s)) => {
            if s == l {
                Some(DiffKind::RemoteRemove)
            } else {
                Some(DiffKind::ConflictingRemoteRemove)
            }
        }
        (None, None, _) => None,
    }
}

/// Live view of one differing path: current identities plus stored metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffEntry {
    pub path: String,
    pub diff: DiffKind,
    pub local: Option<ContentIdentity>,
    pub remote: Option<ContentIdentity>,
    pub metadata: Option<EntrySyncMetadata>,
}

impl DiffEntry {
    /// Whether an acceptance for the current diff has been recorded.
    pub fn is_decided(&self) -> bool {
        self.metadata
            .as_ref()
            .map(|m| m.diff == Some(self.diff) && m.accepted.is_some())
            .unwrap_or(false)
    }
}
