//! Change log entries.

use crate::ids::{EntryId, RecordId};
use crate::record::SyncRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of local mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Record was created.
    Create,
    /// Record was updated.
    Update,
    /// Record was deleted.
    Delete,
}

impl Operation {
    /// Returns true for deletes.
    pub fn is_delete(&self) -> bool {
        matches!(self, Operation::Delete)
    }
}

/// Lifecycle of a change log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum EntryState {
    /// Awaiting transmission.
    Pending,
    /// Rejected by server validation. Still unsynced, but not retried
    /// automatically.
    Failed {
        /// Reason reported by the server.
        reason: String,
    },
    /// Confirmed accepted by the server.
    Transmitted,
    /// Replaced by a later entry or by conflict resolution.
    Superseded,
}

impl EntryState {
    /// Returns true while the entry still represents unsynced work.
    pub fn is_unsynced(&self) -> bool {
        matches!(self, EntryState::Pending | EntryState::Failed { .. })
    }
}

/// A local mutation awaiting transmission.
///
/// Entries are exclusively owned by the change log. Other components hold
/// references or `EntryId`s only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    /// Entry id.
    pub entry_id: EntryId,
    /// Mutated record.
    pub record_id: RecordId,
    /// Entity type of the record.
    pub entity_type: String,
    /// Mutation kind.
    pub operation: Operation,
    /// Record state right after the mutation.
    pub payload_snapshot: SyncRecord,
    /// Server version this mutation was based on.
    pub base_version: u64,
    /// When the mutation committed locally.
    pub created_at: DateTime<Utc>,
    /// Lifecycle state.
    pub state: EntryState,
}

impl ChangeLogEntry {
    /// Creates a pending entry from a committed record snapshot.
    pub fn new(
        operation: Operation,
        payload_snapshot: SyncRecord,
        base_version: u64,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            entry_id: EntryId::new(),
            record_id: payload_snapshot.id,
            entity_type: payload_snapshot.entity_type.clone(),
            operation,
            payload_snapshot,
            base_version,
            created_at,
            state: EntryState::Pending,
        }
    }

    /// Returns true if the entry can be pushed automatically.
    pub fn is_transmittable(&self) -> bool {
        matches!(self.state, EntryState::Pending)
    }

    /// Returns the validation failure reason, if any.
    pub fn failure_reason(&self) -> Option<&str> {
        match &self.state {
            EntryState::Failed { reason } => Some(reason),
            _ => None,
        }
    }
}
