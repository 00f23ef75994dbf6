//! Conflict detection and resolution.
//!
//! Resolution is whole-record last-write-wins. The losing version is kept
//! verbatim in the returned [`Conflict`] so the user can inspect or
//! restore it; payloads are never merged field by field.

use chrono::{DateTime, Utc};
use fieldsync_protocol::{
    Conflict, ConflictId, ConflictKind, ConflictState, Resolution, SyncRecord,
};
use std::cmp::Ordering;

/// Result of resolving a diverged record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    /// The version that becomes authoritative.
    pub winner: SyncRecord,
    /// Which side won.
    pub resolution: Resolution,
    /// The archived conflict.
    pub conflict: Conflict,
}

impl Resolved {
    /// Returns true if the winning side still needs a human decision.
    pub fn requires_confirmation(&self) -> bool {
        self.conflict.requires_confirmation()
    }
}

/// Outcome of checking a pushed entry against the server's copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// The server is still at the entry's base version.
    Clean,
    /// The server moved on; the record was resolved.
    Conflict(Box<Resolved>),
}

/// Deterministic last-write-wins resolver.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver;

impl ConflictResolver {
    /// Creates a resolver.
    pub fn new() -> Self {
        Self
    }

    /// Checks whether `remote` advanced past `base_version` and resolves if
    /// it did.
    pub fn check(
        &self,
        base_version: u64,
        local: &SyncRecord,
        remote: &SyncRecord,
        now: DateTime<Utc>,
    ) -> Verdict {
        if remote.version == base_version {
            return Verdict::Clean;
        }
        Verdict::Conflict(Box::new(self.resolve(local, remote, now)))
    }

    /// Picks a winner between two versions of one record.
    ///
    /// - Update against update: later `updated_at` wins, then higher
    ///   version, then the local side.
    /// - Delete against update: the delete wins only if strictly later.
    ///   When the update wins the conflict awaits confirmation.
    /// - Delete against delete: the server's tombstone is kept.
    pub fn resolve(
        &self,
        local: &SyncRecord,
        remote: &SyncRecord,
        now: DateTime<Utc>,
    ) -> Resolved {
        let kind = ConflictKind::classify(local, remote);

        let (resolution, state) = match kind {
            ConflictKind::UpdateUpdate => {
                (last_write_wins(local, remote), ConflictState::AutoResolved)
            }
            ConflictKind::DeleteDelete => (Resolution::RemoteWins, ConflictState::AutoResolved),
            ConflictKind::LocalDelete => {
                if local.updated_at > remote.updated_at {
                    (Resolution::LocalWins, ConflictState::AutoResolved)
                } else {
                    (Resolution::RemoteWins, ConflictState::AwaitingConfirmation)
                }
            }
            ConflictKind::RemoteDelete => {
                if remote.updated_at > local.updated_at {
                    (Resolution::RemoteWins, ConflictState::AutoResolved)
                } else {
                    (Resolution::LocalWins, ConflictState::AwaitingConfirmation)
                }
            }
        };

        let (winner, losing) = match resolution {
            Resolution::LocalWins => (local.clone(), remote.clone()),
            Resolution::RemoteWins => (remote.clone(), local.clone()),
        };

        Resolved {
            winner,
            resolution,
            conflict: Conflict {
                id: ConflictId::new(),
                record_id: local.id,
                local_version: local.version,
                remote_version: remote.version,
                local_updated_at: local.updated_at,
                remote_updated_at: remote.updated_at,
                resolution,
                resolved_at: now,
                notified_user: false,
                kind,
                state,
                losing,
            },
        }
    }
}

fn last_write_wins(local: &SyncRecord, remote: &SyncRecord) -> Resolution {
    match local
        .updated_at
        .cmp(&remote.updated_at)
        .then_with(|| local.version.cmp(&remote.version))
    {
        Ordering::Less => Resolution::RemoteWins,
        Ordering::Equal | Ordering::Greater => Resolution::LocalWins,
    }
}
