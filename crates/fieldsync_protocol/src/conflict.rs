//! Conflict records.

use crate::ids::{ConflictId, RecordId};
use crate::record::SyncRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which side won a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Resolution {
    /// The local version was kept.
    LocalWins,
    /// The server version was adopted.
    RemoteWins,
}

/// Shape of the divergence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Both sides wrote live versions.
    UpdateUpdate,
    /// Local delete raced a remote update.
    LocalDelete,
    /// Local update raced a remote delete.
    RemoteDelete,
    /// Both sides deleted the record.
    DeleteDelete,
}

impl ConflictKind {
    /// Classifies a conflict from the two competing versions.
    pub fn classify(local: &SyncRecord, remote: &SyncRecord) -> Self {
        match (local.deleted, remote.deleted) {
            (false, false) => ConflictKind::UpdateUpdate,
            (true, false) => ConflictKind::LocalDelete,
            (false, true) => ConflictKind::RemoteDelete,
            (true, true) => ConflictKind::DeleteDelete,
        }
    }

    /// Returns true when exactly one side is a delete.
    pub fn is_delete_race(&self) -> bool {
        matches!(self, ConflictKind::LocalDelete | ConflictKind::RemoteDelete)
    }
}

/// Follow-up state of an archived conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictState {
    /// Resolved automatically; nothing to do.
    AutoResolved,
    /// A delete lost; a human must confirm before anything destructive.
    AwaitingConfirmation,
    /// A human accepted the automatic outcome.
    Confirmed,
    /// A human re-applied the losing version.
    Overridden,
}

/// A detected divergence between local and server versions of one record.
///
/// The losing version is kept verbatim for audit and manual override.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    /// Conflict id.
    pub id: ConflictId,
    /// Record in conflict.
    pub record_id: RecordId,
    /// Local version at detection time.
    pub local_version: u64,
    /// Server version at detection time.
    pub remote_version: u64,
    /// Local mutation time.
    pub local_updated_at: DateTime<Utc>,
    /// Server mutation time.
    pub remote_updated_at: DateTime<Utc>,
    /// Winning side.
    pub resolution: Resolution,
    /// When the resolver decided.
    pub resolved_at: DateTime<Utc>,
    /// Whether the user has been told about it.
    pub notified_user: bool,
    /// Divergence shape.
    pub kind: ConflictKind,
    /// Follow-up state.
    pub state: ConflictState,
    /// The version that lost, verbatim.
    pub losing: SyncRecord,
}

impl Conflict {
    /// Returns true if a human must confirm the outcome.
    pub fn requires_confirmation(&self) -> bool {
        matches!(self.state, ConflictState::AwaitingConfirmation)
    }

    /// Returns true if the conflict is older than `retention` at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>, retention: chrono::Duration) -> bool {
        now.signed_duration_since(self.resolved_at) > retention
    }
}
