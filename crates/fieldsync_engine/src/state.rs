//! Coordinator state machine and counters.

use chrono::{DateTime, Utc};
use std::fmt;

/// State of the sync coordinator.
///
/// ```text
/// Idle -> Pulling -> Pushing -> Reconciling -> Committing -> Idle
///            \          \            \              \
///             +----------+------------+--------------+--> Failed
/// ```
///
/// `Reconciling` may return to `Pushing` to send entries rebased onto a
/// conflict the local side won. A new session may start from `Idle` or
/// `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncState {
    /// Waiting for a trigger.
    Idle,
    /// Fetching server changes.
    Pulling,
    /// Transmitting change log entries.
    Pushing,
    /// Resolving rejected conflicts.
    Reconciling,
    /// Applying the session's results locally.
    Committing,
    /// The last session aborted.
    Failed,
}

impl SyncState {
    /// Returns true while a session runs.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SyncState::Pulling | SyncState::Pushing | SyncState::Reconciling | SyncState::Committing
        )
    }

    /// Returns true if a session may start.
    pub fn can_start_session(&self) -> bool {
        matches!(self, SyncState::Idle | SyncState::Failed)
    }

    /// Returns true if `next` is a legal successor.
    pub fn can_transition_to(&self, next: SyncState) -> bool {
        use SyncState::*;
        match (self, next) {
            (Idle | Failed, Pulling) => true,
            (Pulling, Pushing) | (Pushing, Reconciling) | (Reconciling, Committing) => true,
            (Reconciling, Pushing) => true,
            (Committing, Idle) => true,
            (state, Failed) => state.is_active(),
            _ => false,
        }
    }

    /// Lowercase state name.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Idle => "idle",
            SyncState::Pulling => "pulling",
            SyncState::Pushing => "pushing",
            SyncState::Reconciling => "reconciling",
            SyncState::Committing => "committing",
            SyncState::Failed => "failed",
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters aggregated across sessions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Sessions that ended `success`.
    pub sessions_succeeded: u64,
    /// Sessions that ended `partial`.
    pub sessions_partial: u64,
    /// Sessions that ended `failed`.
    pub sessions_failed: u64,
    /// Triggers absorbed by an active session.
    pub triggers_coalesced: u64,
    /// Entries transmitted.
    pub entries_pushed: u64,
    /// Entries accepted.
    pub entries_accepted: u64,
    /// Records pulled.
    pub records_pulled: u64,
    /// Conflicts resolved.
    pub conflicts_resolved: u64,
    /// Validation rejections.
    pub validation_failures: u64,
    /// Consistency violations seen.
    pub consistency_violations: u64,
    /// End of the last session.
    pub last_session_at: Option<DateTime<Utc>>,
    /// Error of the last failed session.
    pub last_error: Option<String>,
}
