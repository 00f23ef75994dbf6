//! Session reports and the audit history.

use chrono::{DateTime, Utc};
use fieldsync_protocol::{Conflict, EntryId, RecordId, SessionId, SyncRecord};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What started a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    /// The network came back.
    ConnectivityRestored,
    /// The periodic timer fired.
    Periodic,
    /// The user asked for a sync.
    Manual,
}

impl fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncTrigger::ConnectivityRestored => "connectivity_restored",
            SyncTrigger::Periodic => "periodic",
            SyncTrigger::Manual => "manual",
        };
        f.write_str(name)
    }
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionResult {
    /// Every pushed entry was accepted or auto-resolved.
    Success,
    /// The session committed, but some work is left: validation rejects,
    /// conflicts awaiting confirmation or deferred entries.
    Partial,
    /// The session aborted. Unconfirmed entries stay pending.
    Failed,
}

impl fmt::Display for SessionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionResult::Success => "success",
            SessionResult::Partial => "partial",
            SessionResult::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A validation rejection surfaced to the record owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationFailure {
    /// Rejected record.
    pub record_id: RecordId,
    /// Rejected entry. It stays unsynced with this reason attached.
    pub entry_id: EntryId,
    /// Server-supplied reason.
    pub reason: String,
}

/// Two copies of one record with equal version but different content.
///
/// Never resolved automatically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViolationReport {
    /// Affected record.
    pub record_id: RecordId,
    /// The shared version.
    pub version: u64,
    /// Local copy.
    pub local: SyncRecord,
    /// Server copy.
    pub remote: SyncRecord,
    /// When it was detected.
    pub detected_at: DateTime<Utc>,
}

/// Full result of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    /// Session identifier.
    pub session_id: SessionId,
    /// What started the session.
    pub trigger: SyncTrigger,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// End time.
    pub finished_at: DateTime<Utc>,
    /// Pull cursor the session started from.
    pub last_sync_timestamp: Option<DateTime<Utc>>,
    /// Entries transmitted.
    pub pushed: usize,
    /// Entries accepted by the server.
    pub accepted: usize,
    /// Records received from the server.
    pub pulled: usize,
    /// Conflicts resolved in this session.
    pub conflicts: Vec<Conflict>,
    /// Validation rejections.
    pub validation_failures: Vec<ValidationFailure>,
    /// Entries left pending for a later session.
    pub deferred: usize,
    /// Consistency violations detected.
    pub consistency_violations: Vec<ViolationReport>,
    /// Outcome.
    pub result: SessionResult,
    /// Error that failed the session, if any.
    pub error: Option<String>,
}

impl SessionReport {
    /// Conflicts that need the user's confirmation.
    pub fn conflicts_requiring_confirmation(&self) -> impl Iterator<Item = &Conflict> {
        self.conflicts.iter().filter(|c| c.requires_confirmation())
    }

    /// Condenses the report for the audit history.
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id,
            trigger: self.trigger,
            started_at: self.started_at,
            finished_at: self.finished_at,
            result: self.result,
            pushed: self.pushed,
            accepted: self.accepted,
            pulled: self.pulled,
            conflicts: self.conflicts.len(),
            validation_failures: self.validation_failures.len(),
            deferred: self.deferred,
            consistency_violations: self.consistency_violations.len(),
            error: self.error.clone(),
        }
    }
}

/// Audit-log entry for a finished session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub trigger: SyncTrigger,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub result: SessionResult,
    pub pushed: usize,
    pub accepted: usize,
    pub pulled: usize,
    pub conflicts: usize,
    pub validation_failures: usize,
    pub deferred: usize,
    pub consistency_violations: usize,
    pub error: Option<String>,
}

/// What `run_session` did with a trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// A session ran to the end (successfully or not).
    Completed(Box<SessionReport>),
    /// Another session was active; the trigger was absorbed by it.
    Coalesced,
}

impl SessionOutcome {
    /// Returns the report of a completed session.
    pub fn report(&self) -> Option<&SessionReport> {
        match self {
            SessionOutcome::Completed(report) => Some(report),
            SessionOutcome::Coalesced => None,
        }
    }

    /// Returns the report, if any, by value.
    pub fn into_report(self) -> Option<SessionReport> {
        match self {
            SessionOutcome::Completed(report) => Some(*report),
            SessionOutcome::Coalesced => None,
        }
    }
}
