//! Syncable records.

use crate::ids::RecordId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Local synchronization status of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Local copy matches a server-accepted version.
    Synced,
    /// Local mutations have not yet been accepted by the server.
    Pending,
    /// A conflict awaits human confirmation.
    Conflict,
}

impl SyncStatus {
    /// Returns true if the record carries work the server has not confirmed.
    pub fn is_unsynced(&self) -> bool {
        !matches!(self, SyncStatus::Synced)
    }
}

/// A syncable record.
///
/// The engine treats `payload` as opaque bytes; only the entity owner
/// interprets it. `critical_complete` is computed by the owner when it
/// mutates the record.
///
/// # Invariants
///
/// - `version` strictly increases with each accepted mutation.
/// - Two records with equal `id` and `version` are identical in every field.
///   Anything else is a split-brain bug and surfaces as a consistency
///   violation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRecord {
    /// Record id.
    pub id: RecordId,
    /// Entity type (profile, measurement, inventory, message, ...).
    pub entity_type: String,
    /// Version counter used for optimistic concurrency.
    pub version: u64,
    /// Time of the last mutation; the last-write-wins field.
    pub updated_at: DateTime<Utc>,
    /// Whether all fields essential for downstream use are present.
    pub critical_complete: bool,
    /// Tombstone marker.
    pub deleted: bool,
    /// Entity payload.
    pub payload: Vec<u8>,
}

impl SyncRecord {
    /// Creates a live record.
    pub fn new(
        id: RecordId,
        entity_type: impl Into<String>,
        version: u64,
        updated_at: DateTime<Utc>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            id,
            entity_type: entity_type.into(),
            version,
            updated_at,
            critical_complete: false,
            deleted: false,
            payload,
        }
    }

    /// Sets the critical-complete flag.
    #[must_use]
    pub fn with_critical_complete(mut self, complete: bool) -> Self {
        self.critical_complete = complete;
        self
    }

    /// Returns a tombstone of this record at the given version and time.
    #[must_use]
    pub fn tombstone(&self, version: u64, updated_at: DateTime<Utc>) -> Self {
        Self {
            id: self.id,
            entity_type: self.entity_type.clone(),
            version,
            updated_at,
            critical_complete: self.critical_complete,
            deleted: true,
            payload: Vec::new(),
        }
    }

    /// Returns true if `other` claims the same lineage point (id and version)
    /// but differs in content.
    pub fn diverges_from(&self, other: &SyncRecord) -> bool {
        self.id == other.id && self.version == other.version && self != other
    }

    /// Returns the payload size in bytes.
    pub fn payload_size(&self) -> usize {
        self.payload.len()
    }
}
