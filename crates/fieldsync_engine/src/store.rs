//! Local record store.
//!
//! [`LocalStore`] is the single write path for both user edits and session
//! commits. Every change runs in a [`StoreTxn`] that stages the new state,
//! persists it through a [`StateStore`] and only then publishes it, so a
//! record mutation and its change log entry land together or not at all.

use crate::change_log::ChangeLog;
use crate::clock::{Clock, SystemClock};
use crate::error::{SyncError, SyncResult};
use crate::persist::{MemoryStateStore, StateStore};
use crate::resolver::Resolved;
use crate::scheduler::PriorityScheduler;
use crate::session::{SessionSummary, ViolationReport};
use chrono::{DateTime, Utc};
use fieldsync_protocol::{
    ChangeLogEntry, Conflict, ConflictId, ConflictState, EntryId, EntryState, Operation,
    RecordId, Resolution, SyncRecord, SyncStatus,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A record held on the device plus its sync metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalRecord {
    /// Record content and version.
    pub record: SyncRecord,
    /// Sync status.
    pub sync_status: SyncStatus,
    /// Last read or write touch, used by eviction.
    pub last_accessed_at: DateTime<Utc>,
}

impl LocalRecord {
    /// Returns the record id.
    pub fn id(&self) -> RecordId {
        self.record.id
    }
}

/// Everything the device persists.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceState {
    /// Records by id. Pending deletes are kept as tombstones until accepted.
    pub records: BTreeMap<RecordId, LocalRecord>,
    /// Local mutations awaiting transmission.
    pub change_log: ChangeLog,
    /// Archived conflicts.
    pub conflicts: Vec<Conflict>,
    /// Pull cursor of the last committed session.
    pub last_sync_timestamp: Option<DateTime<Utc>>,
    /// Bounded audit history, oldest first.
    pub sessions: VecDeque<SessionSummary>,
    /// Flagged consistency violations awaiting an administrator.
    pub violations: Vec<ViolationReport>,
}

impl DeviceState {
    /// Returns a record.
    pub fn record(&self, id: RecordId) -> Option<&LocalRecord> {
        self.records.get(&id)
    }

    /// Counts records per sync status: `(synced, pending, conflict)`.
    pub fn status_counts(&self) -> (usize, usize, usize) {
        self.records
            .values()
            .fold((0, 0, 0), |(s, p, c), r| match r.sync_status {
                SyncStatus::Synced => (s + 1, p, c),
                SyncStatus::Pending => (s, p + 1, c),
                SyncStatus::Conflict => (s, p, c + 1),
            })
    }

    /// Looks up the critical-complete flag of a record.
    pub fn is_critical(&self, id: RecordId) -> Option<bool> {
        self.records.get(&id).map(|r| r.record.critical_complete)
    }

    fn conflict_mut(&mut self, id: ConflictId) -> SyncResult<&mut Conflict> {
        self.conflicts
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or(SyncError::UnknownConflict(id))
    }
}

/// What applying a pulled record did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteApply {
    /// New record cached locally.
    Inserted,
    /// Local copy replaced by a newer version.
    Updated,
    /// Remote tombstone removed the local copy.
    Removed,
    /// Same version and content already held, or an unknown tombstone.
    Unchanged,
    /// Local copy is newer.
    Stale,
    /// Local unsynced work exists; the push path decides.
    SkippedPending,
    /// Same id and version with different content.
    Violation(ViolationReport),
}

/// Staged changes against a working copy of the device state.
pub struct StoreTxn<'a> {
    state: &'a mut DeviceState,
    now: DateTime<Utc>,
}

impl StoreTxn<'_> {
    /// Read access to the staged state.
    pub fn state(&self) -> &DeviceState {
        self.state
    }

    /// Transaction timestamp.
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// Creates a record.
    pub fn create(
        &mut self,
        entity_type: &str,
        payload: Vec<u8>,
        critical_complete: bool,
    ) -> SyncResult<ChangeLogEntry> {
        let record = SyncRecord::new(RecordId::new(), entity_type, 0, self.now, payload)
            .with_critical_complete(critical_complete);
        self.record_mutation(Operation::Create, record, 0)?
            .ok_or_else(|| SyncError::storage("create produced no change log entry"))
    }

    /// Replaces the payload of a live record.
    pub fn update(
        &mut self,
        id: RecordId,
        payload: Vec<u8>,
        critical_complete: bool,
    ) -> SyncResult<ChangeLogEntry> {
        let mut next = self.live_record(id)?.clone();
        next.payload = payload;
        next.critical_complete = critical_complete;
        next.updated_at = self.now;
        let base_if_absent = next.version;
        self.record_mutation(Operation::Update, next, base_if_absent)?
            .ok_or_else(|| SyncError::storage("update produced no change log entry"))
    }

    /// Deletes a live record. Returns `None` when the record never reached
    /// the server and was dropped outright.
    pub fn delete(&mut self, id: RecordId) -> SyncResult<Option<ChangeLogEntry>> {
        let current = self.live_record(id)?;
        let next = current.tombstone(current.version, self.now);
        let base_if_absent = current.version;
        self.record_mutation(Operation::Delete, next, base_if_absent)
    }

    fn live_record(&self, id: RecordId) -> SyncResult<&SyncRecord> {
        let local = self.state.records.get(&id).ok_or(SyncError::UnknownRecord(id))?;
        if local.record.deleted {
            return Err(SyncError::RecordDeleted(id));
        }
        Ok(&local.record)
    }

    /// Appends a change log entry for `next` and stores it as the record's
    /// current pending state.
    fn record_mutation(
        &mut self,
        operation: Operation,
        mut next: SyncRecord,
        base_if_absent: u64,
    ) -> SyncResult<Option<ChangeLogEntry>> {
        let record_id = next.id;
        let log = &mut self.state.change_log;
        let collapsible: Vec<(Operation, u64, bool)> = log
            .collapsible_for(record_id)
            .iter()
            .map(|e| (e.operation, e.base_version, matches!(e.state, EntryState::Failed { .. })))
            .collect();
        let has_failed = collapsible.iter().any(|(_, _, failed)| *failed);

        let (operation, base) = match collapsible.first() {
            Some(&(first_op, first_base, _)) if operation.is_delete() || has_failed => {
                let superseded = log.supersede_collapsible(record_id);
                debug!(
                    record_id = %record_id,
                    superseded = superseded.len(),
                    "collapsed unsent entries"
                );
                let never_reached_server = first_op == Operation::Create;
                if operation.is_delete() && never_reached_server {
                    self.state.records.remove(&record_id);
                    debug!(record_id = %record_id, "dropped record that never reached the server");
                    return Ok(None);
                }
                let op = if never_reached_server {
                    Operation::Create
                } else {
                    operation
                };
                (op, first_base)
            }
            _ => {
                let base = self
                    .state
                    .records
                    .get(&record_id)
                    .map_or(base_if_absent, |r| r.record.version);
                (operation, base)
            }
        };

        next.version = base + 1;
        let entry = ChangeLogEntry::new(operation, next.clone(), base, self.now);
        self.state.change_log.append(entry.clone());
        self.state.records.insert(
            record_id,
            LocalRecord {
                record: next,
                sync_status: SyncStatus::Pending,
                last_accessed_at: self.now,
            },
        );
        debug!(
            record_id = %record_id,
            entry_id = %entry.entry_id,
            operation = ?entry.operation,
            base_version = entry.base_version,
            "appended change log entry"
        );
        Ok(Some(entry))
    }

    /// Clears the validation failure of an entry.
    pub fn retry_failed(&mut self, entry_id: EntryId) -> SyncResult<()> {
        self.state.change_log.retry(entry_id)
    }

    /// Applies a record received by pull.
    pub fn apply_remote(&mut self, remote: SyncRecord) -> RemoteApply {
        let record_id = remote.id;
        let Some(local) = self.state.records.get_mut(&record_id) else {
            if remote.deleted {
                return RemoteApply::Unchanged;
            }
            self.state.records.insert(
                record_id,
                LocalRecord {
                    record: remote,
                    sync_status: SyncStatus::Synced,
                    last_accessed_at: self.now,
                },
            );
            return RemoteApply::Inserted;
        };

        if self.state.change_log.has_unsynced(record_id) {
            return RemoteApply::SkippedPending;
        }

        if local.record.diverges_from(&remote) {
            let report = ViolationReport {
                record_id,
                version: remote.version,
                local: local.record.clone(),
                remote,
                detected_at: self.now,
            };
            warn!(
                record_id = %record_id,
                version = report.version,
                "consistency violation: same version, different content"
            );
            let known = self.state.violations.iter().any(|v| {
                v.record_id == report.record_id
                    && v.version == report.version
                    && v.remote == report.remote
            });
            if !known {
                self.state.violations.push(report.clone());
            }
            return RemoteApply::Violation(report);
        }

        if remote.version == local.record.version {
            return RemoteApply::Unchanged;
        }
        if remote.version < local.record.version {
            return RemoteApply::Stale;
        }
        if remote.deleted {
            self.state.records.remove(&record_id);
            return RemoteApply::Removed;
        }
        local.record = remote;
        if local.sync_status == SyncStatus::Pending {
            local.sync_status = SyncStatus::Synced;
        }
        RemoteApply::Updated
    }

    /// Records server acceptance of an entry.
    ///
    /// The record becomes synced only when no later entry is queued for it;
    /// its content is set to exactly what the server accepted.
    pub(crate) fn commit_accepted(
        &mut self,
        entry_id: EntryId,
        server_version: u64,
    ) -> SyncResult<()> {
        let entry = self
            .state
            .change_log
            .get(entry_id)
            .cloned()
            .ok_or(SyncError::UnknownEntry(entry_id))?;
        if !entry.state.is_unsynced() {
            return Ok(());
        }
        self.state.change_log.mark_transmitted(entry_id)?;

        let record_id = entry.record_id;
        if self.state.change_log.has_unsynced(record_id) {
            return Ok(());
        }
        if entry.operation.is_delete() {
            self.state.records.remove(&record_id);
            return Ok(());
        }
        if let Some(local) = self.state.records.get_mut(&record_id) {
            let mut accepted = entry.payload_snapshot;
            accepted.version = server_version;
            local.record = accepted;
            if local.sync_status == SyncStatus::Pending {
                local.sync_status = SyncStatus::Synced;
            }
        }
        Ok(())
    }

    /// Attaches a validation failure to an entry. It stays unsynced.
    pub(crate) fn fail_entry(&mut self, entry_id: EntryId, reason: &str) -> SyncResult<()> {
        self.state.change_log.mark_failed(entry_id, reason)
    }

    /// Applies a conflict resolution and archives the conflict.
    pub(crate) fn apply_resolution(&mut self, resolved: Resolved) -> SyncResult<()> {
        let record_id = resolved.conflict.record_id;
        let server_version = resolved.conflict.remote_version;
        let awaiting = resolved.requires_confirmation();

        match resolved.resolution {
            Resolution::LocalWins => {
                let superseded = self.state.change_log.supersede_unsynced(record_id);
                self.rebase_local(record_id, server_version, &superseded);
            }
            Resolution::RemoteWins => {
                let lost: Vec<EntryId> = self
                    .state
                    .change_log
                    .unsynced_for(record_id)
                    .iter()
                    .filter(|e| self.state.change_log.is_in_flight(e.entry_id))
                    .map(|e| e.entry_id)
                    .collect();
                for entry_id in lost {
                    self.state.change_log.mark_superseded(entry_id)?;
                }

                let survivors = self.state.change_log.supersede_queued(record_id);
                if survivors.is_empty() {
                    self.adopt_remote(resolved.winner, awaiting);
                } else {
                    self.rebase_local(record_id, server_version, &survivors);
                }
            }
        }

        info!(
            record_id = %record_id,
            conflict_id = %resolved.conflict.id,
            resolution = ?resolved.resolution,
            kind = ?resolved.conflict.kind,
            awaiting_confirmation = awaiting,
            "conflict resolved"
        );
        self.state.conflicts.push(resolved.conflict);
        Ok(())
    }

    fn adopt_remote(&mut self, winner: SyncRecord, awaiting: bool) {
        let record_id = winner.id;
        if winner.deleted && !awaiting {
            self.state.records.remove(&record_id);
            return;
        }
        let last_accessed_at = self
            .state
            .records
            .get(&record_id)
            .map_or(self.now, |r| r.last_accessed_at);
        let sync_status = if awaiting {
            SyncStatus::Conflict
        } else {
            SyncStatus::Synced
        };
        self.state.records.insert(
            record_id,
            LocalRecord {
                record: winner,
                sync_status,
                last_accessed_at,
            },
        );
    }

    /// Re-queues the current local content on top of `server_version`.
    fn rebase_local(
        &mut self,
        record_id: RecordId,
        server_version: u64,
        replaced: &[ChangeLogEntry],
    ) {
        let Some(local) = self.state.records.get_mut(&record_id) else {
            return;
        };
        let operation = if local.record.deleted {
            Operation::Delete
        } else {
            Operation::Update
        };
        local.record.version = server_version + 1;
        local.sync_status = SyncStatus::Pending;

        let created_at = replaced
            .iter()
            .map(|e| e.created_at)
            .min()
            .unwrap_or(self.now);
        let snapshot = local.record.clone();
        let entry = ChangeLogEntry::new(operation, snapshot, server_version, created_at);
        debug!(
            record_id = %record_id,
            entry_id = %entry.entry_id,
            base_version = server_version,
            "rebased local changes onto server version"
        );
        self.state.change_log.append(entry);
    }

    /// Drops conflicts past the retention window. Conflicts still awaiting
    /// confirmation are kept.
    pub fn purge_expired_conflicts(&mut self, retention: chrono::Duration) -> usize {
        let now = self.now;
        let before = self.state.conflicts.len();
        self.state
            .conflicts
            .retain(|c| c.requires_confirmation() || !c.is_expired(now, retention));
        before - self.state.conflicts.len()
    }

    /// Marks a conflict as shown to the user.
    pub fn mark_notified(&mut self, id: ConflictId) -> SyncResult<()> {
        self.state.conflict_mut(id)?.notified_user = true;
        Ok(())
    }

    /// Accepts the automatic outcome of a conflict.
    pub fn confirm_conflict(&mut self, id: ConflictId) -> SyncResult<()> {
        let conflict = self.state.conflict_mut(id)?;
        if conflict.state == ConflictState::Overridden {
            return Ok(());
        }
        conflict.state = ConflictState::Confirmed;
        conflict.notified_user = true;
        let record_id = conflict.record_id;

        let has_unsynced = self.state.change_log.has_unsynced(record_id);
        if let Some(local) = self.state.records.get_mut(&record_id) {
            if local.sync_status == SyncStatus::Conflict && !has_unsynced {
                local.sync_status = SyncStatus::Synced;
            }
        }
        Ok(())
    }

    /// Re-applies the losing version of a conflict as a new local mutation.
    pub fn override_conflict(&mut self, id: ConflictId) -> SyncResult<Option<ChangeLogEntry>> {
        let conflict = self.state.conflict_mut(id)?;
        conflict.state = ConflictState::Overridden;
        conflict.notified_user = true;
        let losing = conflict.losing.clone();
        let remote_version = conflict.remote_version;
        let record_id = losing.id;

        let current = self.state.records.get(&record_id).map(|r| r.record.clone());
        let entry = match current {
            Some(current) if losing.deleted => {
                if current.deleted {
                    return Ok(None);
                }
                let next = current.tombstone(current.version, self.now);
                self.record_mutation(Operation::Delete, next, remote_version)?
            }
            None if losing.deleted => return Ok(None),
            Some(current) => {
                let mut next = current;
                next.payload = losing.payload;
                next.critical_complete = losing.critical_complete;
                next.deleted = false;
                next.updated_at = self.now;
                self.record_mutation(Operation::Update, next, remote_version)?
            }
            None => {
                let mut next = losing;
                next.updated_at = self.now;
                self.record_mutation(Operation::Update, next, remote_version)?
            }
        };
        info!(conflict_id = %id, record_id = %record_id, "conflict overridden");
        Ok(entry)
    }

    /// Removes records by id. Callers check eligibility.
    pub(crate) fn remove_records(&mut self, ids: &[RecordId]) {
        for id in ids {
            self.state.records.remove(id);
        }
    }

    pub(crate) fn set_last_sync_timestamp(&mut self, at: DateTime<Utc>) {
        self.state.last_sync_timestamp = Some(at);
    }

    pub(crate) fn record_session(&mut self, summary: SessionSummary, keep: usize) {
        self.state.sessions.push_back(summary);
        while self.state.sessions.len() > keep {
            self.state.sessions.pop_front();
        }
    }

    pub(crate) fn begin_flight(&mut self, ids: impl IntoIterator<Item = EntryId>) {
        self.state.change_log.begin_flight(ids);
    }

    pub(crate) fn mark_sent(&mut self, ids: impl IntoIterator<Item = EntryId>) {
        self.state.change_log.mark_sent(ids);
    }

    pub(crate) fn end_flight(&mut self) {
        self.state.change_log.end_flight();
    }

    pub(crate) fn compact(&mut self) -> usize {
        self.state.change_log.compact()
    }
}

/// Device-side store guarded by a single lock.
pub struct LocalStore {
    state: Mutex<DeviceState>,
    backend: Box<dyn StateStore>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore").finish_non_exhaustive()
    }
}

impl LocalStore {
    /// Opens a store, loading any persisted state.
    pub fn open(backend: Box<dyn StateStore>, clock: Arc<dyn Clock>) -> SyncResult<Self> {
        let state = backend.load()?.unwrap_or_default();
        info!(
            records = state.records.len(),
            unsynced = state.change_log.unsynced_entries().count(),
            "opened local store"
        );
        Ok(Self {
            state: Mutex::new(state),
            backend,
            clock,
        })
    }

    /// Creates an empty in-memory store on the system clock.
    pub fn in_memory() -> Self {
        Self::in_memory_with_clock(Arc::new(SystemClock))
    }

    /// Creates an empty in-memory store on the given clock.
    pub fn in_memory_with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(DeviceState::default()),
            backend: Box::new(MemoryStateStore::new()),
            clock,
        }
    }

    /// Current time on the store's clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Runs `f` against a working copy and publishes it once persisted.
    ///
    /// If `f` or the persist step fails, nothing changes.
    ///
    /// Costs one full clone of the state plus a synchronous write of the
    /// whole state, under the lock. Async callers block their worker for the
    /// write.
    pub fn transaction<R, F>(&self, f: F) -> SyncResult<R>
    where
        F: FnOnce(&mut StoreTxn<'_>) -> SyncResult<R>,
    {
        let mut guard = self.state.lock();
        let mut working = guard.clone();
        let mut txn = StoreTxn {
            state: &mut working,
            now: self.clock.now(),
        };
        let out = f(&mut txn)?;
        self.backend.persist(&working)?;
        *guard = working;
        Ok(out)
    }

    /// Runs `f` with shared access to the current state.
    pub fn read<R>(&self, f: impl FnOnce(&DeviceState) -> R) -> R {
        f(&self.state.lock())
    }

    /// Clones the current state.
    pub fn snapshot(&self) -> DeviceState {
        self.state.lock().clone()
    }

    /// Creates a record. See [`StoreTxn::create`].
    pub fn create(
        &self,
        entity_type: &str,
        payload: Vec<u8>,
        critical_complete: bool,
    ) -> SyncResult<ChangeLogEntry> {
        self.transaction(|txn| txn.create(entity_type, payload, critical_complete))
    }

    /// Updates a record. See [`StoreTxn::update`].
    pub fn update(
        &self,
        id: RecordId,
        payload: Vec<u8>,
        critical_complete: bool,
    ) -> SyncResult<ChangeLogEntry> {
        self.transaction(|txn| txn.update(id, payload, critical_complete))
    }

    /// Deletes a record. See [`StoreTxn::delete`].
    pub fn delete(&self, id: RecordId) -> SyncResult<Option<ChangeLogEntry>> {
        self.transaction(|txn| txn.delete(id))
    }

    /// Reads a live record and touches its access time.
    ///
    /// The touch is persisted with the next transaction.
    pub fn get(&self, id: RecordId) -> Option<SyncRecord> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let local = state.records.get_mut(&id)?;
        if local.record.deleted {
            return None;
        }
        local.last_accessed_at = now;
        Some(local.record.clone())
    }

    /// Reads a record with its metadata without touching it.
    pub fn peek(&self, id: RecordId) -> Option<LocalRecord> {
        self.state.lock().records.get(&id).cloned()
    }

    /// Clears a validation failure so the entry is pushed again.
    pub fn retry_failed(&self, entry_id: EntryId) -> SyncResult<()> {
        self.transaction(|txn| txn.retry_failed(entry_id))
    }

    /// Pushable entries in append order.
    pub fn pending_entries(&self) -> Vec<ChangeLogEntry> {
        self.read(|s| s.change_log.pending_entries().into_iter().cloned().collect())
    }

    /// Pending and failed entries in append order.
    pub fn unsynced_entries(&self) -> Vec<ChangeLogEntry> {
        self.read(|s| s.change_log.unsynced_entries().cloned().collect())
    }

    /// All archived conflicts.
    pub fn conflicts(&self) -> Vec<Conflict> {
        self.read(|s| s.conflicts.clone())
    }

    /// Conflicts not yet shown to the user or awaiting confirmation.
    pub fn conflicts_requiring_attention(&self) -> Vec<Conflict> {
        self.read(|s| {
            s.conflicts
                .iter()
                .filter(|c| !c.notified_user || c.requires_confirmation())
                .cloned()
                .collect()
        })
    }

    /// See [`StoreTxn::mark_notified`].
    pub fn mark_notified(&self, id: ConflictId) -> SyncResult<()> {
        self.transaction(|txn| txn.mark_notified(id))
    }

    /// See [`StoreTxn::confirm_conflict`].
    pub fn confirm_conflict(&self, id: ConflictId) -> SyncResult<()> {
        self.transaction(|txn| txn.confirm_conflict(id))
    }

    /// See [`StoreTxn::override_conflict`].
    pub fn override_conflict(&self, id: ConflictId) -> SyncResult<Option<ChangeLogEntry>> {
        self.transaction(|txn| txn.override_conflict(id))
    }

    /// Drops expired conflicts and returns how many were removed.
    pub fn purge_expired_conflicts(&self, retention: chrono::Duration) -> SyncResult<usize> {
        self.transaction(|txn| Ok(txn.purge_expired_conflicts(retention)))
    }

    /// Pull cursor of the last committed session.
    pub fn last_sync_timestamp(&self) -> Option<DateTime<Utc>> {
        self.read(|s| s.last_sync_timestamp)
    }

    /// Audit history, oldest first.
    pub fn sessions(&self) -> Vec<SessionSummary> {
        self.read(|s| s.sessions.iter().cloned().collect())
    }

    /// Flagged consistency violations.
    pub fn violations(&self) -> Vec<ViolationReport> {
        self.read(|s| s.violations.clone())
    }

    /// Orders the pushable entries and marks them in flight.
    ///
    /// In-flight marks are not persisted; a restart clears them.
    pub(crate) fn begin_push(&self, scheduler: &PriorityScheduler) -> Vec<ChangeLogEntry> {
        let mut state = self.state.lock();
        let ordered: Vec<ChangeLogEntry> = {
            let pending = state.change_log.pending_entries();
            scheduler
                .order(&pending, |id| state.is_critical(id))
                .into_iter()
                .cloned()
                .collect()
        };
        state.change_log.begin_flight(ordered.iter().map(|e| e.entry_id));
        ordered
    }

    /// Applies conflicts the local side won and returns the rebased entries,
    /// ordered and marked in flight, so they can go out in the same session.
    pub(crate) fn rebase_winners(
        &self,
        resolved: Vec<Resolved>,
        scheduler: &PriorityScheduler,
    ) -> SyncResult<Vec<ChangeLogEntry>> {
        self.transaction(|txn| {
            let mut records = HashSet::new();
            for resolved in resolved {
                records.insert(resolved.conflict.record_id);
                txn.apply_resolution(resolved)?;
            }
            let state = txn.state();
            let ordered: Vec<ChangeLogEntry> = {
                let pending: Vec<&ChangeLogEntry> = state
                    .change_log
                    .pending_entries()
                    .into_iter()
                    .filter(|e| records.contains(&e.record_id))
                    .filter(|e| !state.change_log.is_in_flight(e.entry_id))
                    .collect();
                scheduler
                    .order(&pending, |id| state.is_critical(id))
                    .into_iter()
                    .cloned()
                    .collect()
            };
            txn.begin_flight(ordered.iter().map(|e| e.entry_id));
            Ok(ordered)
        })
    }

    /// Persists that these entries are about to be sent.
    ///
    /// A sent entry may be applied even if its response is lost, so later
    /// local deletes no longer collapse it. The write completes before the
    /// batch goes out, so it runs inline on the session task.
    pub(crate) fn mark_sent(&self, ids: &[EntryId]) -> SyncResult<()> {
        self.transaction(|txn| {
            txn.mark_sent(ids.iter().copied());
            Ok(())
        })
    }

    /// Clears the in-flight marks without persisting.
    pub(crate) fn clear_in_flight(&self) {
        self.state.lock().change_log.end_flight();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::resolver::ConflictResolver;
    use chrono::{Duration, TimeZone};

    fn store() -> (LocalStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap()));
        (LocalStore::in_memory_with_clock(clock.clone()), clock)
    }

    #[test]
    fn create_appends_pending_entry() {
        let (store, _) = store();
        let entry = store.create("profile", b"amina".to_vec(), true).unwrap();

        assert_eq!(entry.operation, Operation::Create);
        assert_eq!(entry.base_version, 0);
        let local = store.peek(entry.record_id).unwrap();
        assert_eq!(local.record.version, 1);
        assert_eq!(local.sync_status, SyncStatus::Pending);
        assert_eq!(store.pending_entries().len(), 1);
    }

    #[test]
    fn updates_chain_base_versions() {
        let (store, _) = store();
        let created = store.create("profile", b"a".to_vec(), false).unwrap();
        let first = store.update(created.record_id, b"b".to_vec(), false).unwrap();
        let second = store.update(created.record_id, b"c".to_vec(), true).unwrap();

        assert_eq!(first.base_version, 1);
        assert_eq!(second.base_version, 2);
        assert_eq!(store.peek(created.record_id).unwrap().record.version, 3);
    }

    #[test]
    fn delete_of_unsent_create_drops_everything() {
        let (store, _) = store();
        let created = store.create("note", b"draft".to_vec(), false).unwrap();
        store.update(created.record_id, b"draft 2".to_vec(), false).unwrap();

        assert!(store.delete(created.record_id).unwrap().is_none());
        assert!(store.peek(created.record_id).is_none());
        assert!(store.pending_entries().is_empty());
    }

    #[test]
    fn delete_collapses_queued_updates() {
        let (store, _) = store();
        let id = RecordId::from_u128(9);
        let remote = SyncRecord::new(id, "note", 4, store.now(), b"server".to_vec());
        store.transaction(|txn| Ok(txn.apply_remote(remote))).unwrap();

        store.update(id, b"edit".to_vec(), false).unwrap();
        let delete = store.delete(id).unwrap().unwrap();

        assert_eq!(delete.base_version, 4);
        let pending = store.pending_entries();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].operation, Operation::Delete);
        assert!(store.get(id).is_none());
        assert!(store.peek(id).unwrap().record.deleted);
    }

    #[test]
    fn in_flight_entries_survive_local_delete() {
        let (store, _) = store();
        let id = RecordId::from_u128(9);
        let remote = SyncRecord::new(id, "note", 4, store.now(), b"server".to_vec());
        store.transaction(|txn| Ok(txn.apply_remote(remote))).unwrap();
        let update = store.update(id, b"edit".to_vec(), false).unwrap();

        store
            .transaction(|txn| {
                txn.begin_flight([update.entry_id]);
                Ok(())
            })
            .unwrap();
        let delete = store.delete(id).unwrap().unwrap();
        assert_eq!(delete.base_version, 5);
        assert_eq!(store.unsynced_entries().len(), 2);

        assert_eq!(store.pending_entries().len(), 2);
    }

    #[test]
    fn delete_after_unanswered_create_keeps_both() {
        let (store, _) = store();
        let created = store.create("note", b"sent".to_vec(), false).unwrap();
        store.mark_sent(&[created.entry_id]).unwrap();

        let delete = store.delete(created.record_id).unwrap().unwrap();
        assert_eq!(delete.operation, Operation::Delete);
        assert_eq!(delete.base_version, 1);
        let ops: Vec<_> = store.unsynced_entries().iter().map(|e| e.operation).collect();
        assert_eq!(ops, vec![Operation::Create, Operation::Delete]);
        assert!(store.peek(created.record_id).unwrap().record.deleted);
    }

    #[test]
    fn mutation_after_validation_failure_replaces_it() {
        let (store, _) = store();
        let created = store.create("measurement", vec![], false).unwrap();
        store
            .transaction(|txn| txn.fail_entry(created.entry_id, "empty payload"))
            .unwrap();
        assert!(store.pending_entries().is_empty());

        let fixed = store.update(created.record_id, b"42kg".to_vec(), true).unwrap();
        assert_eq!(fixed.operation, Operation::Create);
        assert_eq!(fixed.base_version, 0);
        assert_eq!(store.unsynced_entries().len(), 1);
    }

    #[test]
    fn retry_failed_requeues_entry() {
        let (store, _) = store();
        let created = store.create("measurement", vec![1], false).unwrap();
        store.transaction(|txn| txn.fail_entry(created.entry_id, "bad")).unwrap();
        store.retry_failed(created.entry_id).unwrap();
        assert_eq!(store.pending_entries().len(), 1);
    }

    #[test]
    fn accepted_entry_marks_record_synced() {
        let (store, _) = store();
        let created = store.create("profile", b"x".to_vec(), false).unwrap();
        store
            .transaction(|txn| txn.commit_accepted(created.entry_id, 1))
            .unwrap();

        let local = store.peek(created.record_id).unwrap();
        assert_eq!(local.sync_status, SyncStatus::Synced);
        assert_eq!(local.record.version, 1);
    }

    #[test]
    fn accepted_entry_with_followers_stays_pending() {
        let (store, _) = store();
        let created = store.create("profile", b"x".to_vec(), false).unwrap();
        store.update(created.record_id, b"y".to_vec(), false).unwrap();
        store
            .transaction(|txn| txn.commit_accepted(created.entry_id, 1))
            .unwrap();

        let local = store.peek(created.record_id).unwrap();
        assert_eq!(local.sync_status, SyncStatus::Pending);
        assert_eq!(local.record.payload, b"y".to_vec());
    }

    #[test]
    fn failed_persist_leaves_state_untouched() {
        let backend = Arc::new(MemoryStateStore::new());
        struct Shared(Arc<MemoryStateStore>);
        impl StateStore for Shared {
            fn load(&self) -> SyncResult<Option<DeviceState>> {
                self.0.load()
            }
            fn persist(&self, state: &DeviceState) -> SyncResult<()> {
                self.0.persist(state)
            }
        }
        let store =
            LocalStore::open(Box::new(Shared(backend.clone())), Arc::new(SystemClock)).unwrap();

        backend.set_fail_writes(true);
        let err = store.create("profile", b"x".to_vec(), false).unwrap_err();
        assert!(err.is_fatal_local());
        assert!(store.snapshot().records.is_empty());
        assert!(store.pending_entries().is_empty());
    }

    #[test]
    fn pulled_divergent_copy_is_flagged() {
        let (store, _) = store();
        let id = RecordId::from_u128(3);
        let ours = SyncRecord::new(id, "visit", 2, store.now(), b"ours".to_vec());
        let theirs = SyncRecord::new(id, "visit", 2, store.now(), b"theirs".to_vec());

        store.transaction(|txn| Ok(txn.apply_remote(ours.clone()))).unwrap();
        let outcome = store.transaction(|txn| Ok(txn.apply_remote(theirs.clone()))).unwrap();

        assert!(matches!(outcome, RemoteApply::Violation(_)));
        assert_eq!(store.peek(id).unwrap().record, ours);
        assert_eq!(store.violations().len(), 1);

        store.transaction(|txn| Ok(txn.apply_remote(theirs))).unwrap();
        assert_eq!(store.violations().len(), 1);
    }

    #[test]
    fn pulled_tombstone_removes_synced_record() {
        let (store, clock) = store();
        let id = RecordId::from_u128(3);
        let live = SyncRecord::new(id, "visit", 2, store.now(), b"v".to_vec());
        store.transaction(|txn| Ok(txn.apply_remote(live.clone()))).unwrap();

        clock.advance(Duration::minutes(5));
        let dead = live.tombstone(3, clock.now());
        let outcome = store.transaction(|txn| Ok(txn.apply_remote(dead))).unwrap();
        assert_eq!(outcome, RemoteApply::Removed);
        assert!(store.peek(id).is_none());
    }

    #[test]
    fn remote_win_over_local_delete_awaits_confirmation() {
        let (store, clock) = store();
        let id = RecordId::from_u128(5);
        let base = SyncRecord::new(id, "inventory", 3, store.now(), b"10 bags".to_vec());
        store.transaction(|txn| Ok(txn.apply_remote(base.clone()))).unwrap();

        let delete = store.delete(id).unwrap().unwrap();
        store
            .transaction(|txn| {
                txn.begin_flight([delete.entry_id]);
                Ok(())
            })
            .unwrap();

        clock.advance(Duration::hours(1));
        let mut remote = base.clone();
        remote.version = 4;
        remote.payload = b"12 bags".to_vec();
        remote.updated_at = clock.now();

        let local = store.peek(id).unwrap().record;
        let resolved = ConflictResolver::new().resolve(&local, &remote, clock.now());
        assert!(resolved.requires_confirmation());
        store.transaction(|txn| txn.apply_resolution(resolved)).unwrap();
        store.clear_in_flight();

        let after = store.peek(id).unwrap();
        assert_eq!(after.sync_status, SyncStatus::Conflict);
        assert_eq!(after.record, remote);
        assert!(store.unsynced_entries().is_empty());

        let conflict = store.conflicts_requiring_attention().remove(0);
        store.confirm_conflict(conflict.id).unwrap();
        assert_eq!(store.peek(id).unwrap().sync_status, SyncStatus::Synced);
        assert!(store.conflicts_requiring_attention().is_empty());
    }

    #[test]
    fn override_reapplies_losing_version() {
        let (store, clock) = store();
        let id = RecordId::from_u128(6);
        let base = SyncRecord::new(id, "profile", 3, store.now(), b"mine".to_vec());
        store.transaction(|txn| Ok(txn.apply_remote(base.clone()))).unwrap();
        let update = store.update(id, b"mine v2".to_vec(), false).unwrap();
        store
            .transaction(|txn| {
                txn.begin_flight([update.entry_id]);
                Ok(())
            })
            .unwrap();

        clock.advance(Duration::hours(1));
        let mut remote = base;
        remote.version = 4;
        remote.payload = b"theirs".to_vec();
        remote.updated_at = clock.now();
        let local = store.peek(id).unwrap().record;
        let resolved = ConflictResolver::new().resolve(&local, &remote, clock.now());
        let conflict_id = resolved.conflict.id;
        store.transaction(|txn| txn.apply_resolution(resolved)).unwrap();
        store.clear_in_flight();
        assert_eq!(store.peek(id).unwrap().sync_status, SyncStatus::Synced);

        let entry = store.override_conflict(conflict_id).unwrap().unwrap();
        assert_eq!(entry.base_version, 4);
        assert_eq!(entry.payload_snapshot.payload, b"mine v2".to_vec());
        assert_eq!(store.peek(id).unwrap().sync_status, SyncStatus::Pending);
        assert_eq!(store.conflicts()[0].state, ConflictState::Overridden);
    }

    #[test]
    fn purge_keeps_recent_and_unconfirmed() {
        let (store, clock) = store();
        let id = RecordId::from_u128(8);
        let local = SyncRecord::new(id, "message", 2, store.now(), b"a".to_vec());
        let later = store.now() + Duration::minutes(1);
        let remote = SyncRecord::new(id, "message", 3, later, b"b".to_vec());
        let resolved = ConflictResolver::new().resolve(&local, &remote, store.now());
        store
            .transaction(|txn| {
                txn.state.conflicts.push(resolved.conflict);
                Ok(())
            })
            .unwrap();

        clock.advance(Duration::days(29));
        assert_eq!(store.purge_expired_conflicts(Duration::days(30)).unwrap(), 0);
        clock.advance(Duration::days(2));
        assert_eq!(store.purge_expired_conflicts(Duration::days(30)).unwrap(), 1);
    }
}
