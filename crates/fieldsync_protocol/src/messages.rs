//! Pull and push messages.

use crate::codec::WireMessage;
use crate::entry::{ChangeLogEntry, Operation};
use crate::error::{ProtocolError, ProtocolResult};
use crate::ids::{DeviceId, EntryId, RecordId};
use crate::record::SyncRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Requests every server change committed after `since`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    /// Requesting device.
    pub device_id: DeviceId,
    /// Exclusive lower bound. `None` pulls everything.
    pub since: Option<DateTime<Utc>>,
}

impl PullRequest {
    /// Creates a pull request.
    pub fn new(device_id: DeviceId, since: Option<DateTime<Utc>>) -> Self {
        Self { device_id, since }
    }
}

/// Server changes since the requested point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullResponse {
    /// Changed records, tombstones included.
    pub records: Vec<SyncRecord>,
    /// Upper bound of this page. Pass it as `since` on the next pull.
    pub server_time: DateTime<Utc>,
    /// The page was cut at the server's limit; pull again from
    /// `server_time` for the rest.
    #[serde(default)]
    pub has_more: bool,
}

impl PullResponse {
    /// Creates a complete pull response.
    pub fn new(records: Vec<SyncRecord>, server_time: DateTime<Utc>) -> Self {
        Self {
            records,
            server_time,
            has_more: false,
        }
    }

    /// Marks whether more changes wait after this page.
    pub fn with_has_more(mut self, has_more: bool) -> Self {
        self.has_more = has_more;
        self
    }
}

/// One mutation offered to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushEntry {
    /// Originating change log entry.
    pub entry_id: EntryId,
    /// Target record.
    pub record_id: RecordId,
    /// Version the mutation was based on.
    pub base_version: u64,
    /// Mutation kind.
    pub operation: Operation,
    /// Proposed record content. The server assigns the version.
    pub payload: SyncRecord,
}

impl From<&ChangeLogEntry> for PushEntry {
    fn from(entry: &ChangeLogEntry) -> Self {
        Self {
            entry_id: entry.entry_id,
            record_id: entry.record_id,
            base_version: entry.base_version,
            operation: entry.operation,
            payload: entry.payload_snapshot.clone(),
        }
    }
}

/// A batch of mutations from one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushRequest {
    /// Pushing device.
    pub device_id: DeviceId,
    /// Entries in transmission order.
    pub entries: Vec<PushEntry>,
}

impl PushRequest {
    /// Creates a push request.
    pub fn new(device_id: DeviceId, entries: Vec<PushEntry>) -> Self {
        Self { device_id, entries }
    }
}

/// Server verdict for one pushed entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PushOutcome {
    /// Written; the server version advanced.
    Accepted,
    /// The server version moved past the entry's base version.
    RejectedConflict,
    /// The payload failed server validation.
    RejectedValidation,
}

/// Per-entry result of a push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disposition {
    /// Record the entry targeted.
    pub record_id: RecordId,
    /// Entry this disposition answers.
    pub entry_id: EntryId,
    /// Verdict.
    pub outcome: PushOutcome,
    /// Server version after the call. Mandatory for conflicts.
    pub server_version: Option<u64>,
    /// Current server record. Mandatory for conflicts.
    pub server_payload: Option<SyncRecord>,
    /// Validation failure reason.
    pub reason: Option<String>,
}

impl Disposition {
    /// Accepted at `server_version`.
    pub fn accepted(entry: &PushEntry, server_version: u64) -> Self {
        Self {
            record_id: entry.record_id,
            entry_id: entry.entry_id,
            outcome: PushOutcome::Accepted,
            server_version: Some(server_version),
            server_payload: None,
            reason: None,
        }
    }

    /// Rejected because the server holds `server_record`.
    pub fn conflict(entry: &PushEntry, server_record: SyncRecord) -> Self {
        Self {
            record_id: entry.record_id,
            entry_id: entry.entry_id,
            outcome: PushOutcome::RejectedConflict,
            server_version: Some(server_record.version),
            server_payload: Some(server_record),
            reason: None,
        }
    }

    /// Rejected by validation.
    pub fn validation(entry: &PushEntry, reason: impl Into<String>) -> Self {
        Self {
            record_id: entry.record_id,
            entry_id: entry.entry_id,
            outcome: PushOutcome::RejectedValidation,
            server_version: None,
            server_payload: None,
            reason: Some(reason.into()),
        }
    }

    /// Checks the fields each outcome requires.
    pub fn validate(&self) -> ProtocolResult<()> {
        match self.outcome {
            PushOutcome::Accepted if self.server_version.is_none() => Err(
                ProtocolError::InvalidMessage(format!(
                    "accepted disposition for {} lacks server_version",
                    self.entry_id
                )),
            ),
            PushOutcome::RejectedConflict
                if self.server_version.is_none() || self.server_payload.is_none() =>
            {
                Err(ProtocolError::InvalidMessage(format!(
                    "conflict disposition for {} lacks server version or payload",
                    self.entry_id
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Dispositions for a push batch.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PushResponse {
    /// One disposition per pushed entry.
    pub dispositions: Vec<Disposition>,
}

impl PushResponse {
    /// Creates a push response.
    pub fn new(dispositions: Vec<Disposition>) -> Self {
        Self { dispositions }
    }
}

impl WireMessage for PullRequest {}
impl WireMessage for PullResponse {}
impl WireMessage for PushRequest {}
impl WireMessage for PushResponse {}
