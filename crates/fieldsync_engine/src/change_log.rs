//! Append-only change log of local mutations.

use crate::error::{SyncError, SyncResult};
use fieldsync_protocol::{ChangeLogEntry, EntryId, EntryState, RecordId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// The change log.
///
/// Entries are kept in append order. State changes (`mark_*`) never reorder
/// or drop entries; only [`ChangeLog::compact`] removes settled ones.
///
/// # Invariants
///
/// - Unsynced entries of one record form a version chain: each entry's
///   `base_version` is one above the previous entry's.
/// - Entries in flight (part of an active push) are never superseded by
///   local mutations.
/// - Entries sent at least once without a known verdict may already be
///   applied on the server, so they are never collapsed either.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeLog {
    entries: Vec<ChangeLogEntry>,
    #[serde(skip)]
    in_flight: HashSet<EntryId>,
    #[serde(default)]
    sent: HashSet<EntryId>,
}

impl ChangeLog {
    /// Creates an empty change log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry. The record mutation must be committed in the same
    /// transaction; see `LocalStore`.
    pub fn append(&mut self, entry: ChangeLogEntry) -> &ChangeLogEntry {
        self.entries.push(entry);
        let last = self.entries.len() - 1;
        &self.entries[last]
    }

    /// Returns entries the coordinator may push, in append order.
    ///
    /// Entries queued behind a validation failure of the same record are
    /// held back: they build on a version the server has not accepted.
    pub fn pending_entries(&self) -> Vec<&ChangeLogEntry> {
        let mut blocked: HashSet<RecordId> = HashSet::new();
        let mut out = Vec::new();
        for entry in &self.entries {
            match entry.state {
                EntryState::Pending if !blocked.contains(&entry.record_id) => out.push(entry),
                EntryState::Failed { .. } => {
                    blocked.insert(entry.record_id);
                }
                _ => {}
            }
        }
        out
    }

    /// Returns every unsynced entry (pending or failed), in append order.
    pub fn unsynced_entries(&self) -> impl Iterator<Item = &ChangeLogEntry> {
        self.entries.iter().filter(|e| e.state.is_unsynced())
    }

    /// Returns the unsynced entries of one record, in append order.
    pub fn unsynced_for(&self, record_id: RecordId) -> Vec<&ChangeLogEntry> {
        self.unsynced_entries()
            .filter(|e| e.record_id == record_id)
            .collect()
    }

    /// Returns unsynced entries of one record that are not in flight.
    pub fn queued_for(&self, record_id: RecordId) -> Vec<&ChangeLogEntry> {
        self.unsynced_entries()
            .filter(|e| e.record_id == record_id && !self.in_flight.contains(&e.entry_id))
            .collect()
    }

    /// Returns the unsynced entries of one record that the server cannot
    /// have applied: not in flight and never sent, or rejected by
    /// validation.
    pub fn collapsible_for(&self, record_id: RecordId) -> Vec<&ChangeLogEntry> {
        self.unsynced_entries()
            .filter(|e| e.record_id == record_id && self.is_collapsible(e.entry_id))
            .collect()
    }

    fn is_collapsible(&self, entry_id: EntryId) -> bool {
        !self.in_flight.contains(&entry_id) && !self.sent.contains(&entry_id)
    }

    /// Returns true if the record has any unsynced entry.
    pub fn has_unsynced(&self, record_id: RecordId) -> bool {
        self.unsynced_entries().any(|e| e.record_id == record_id)
    }

    /// Looks up an entry.
    pub fn get(&self, entry_id: EntryId) -> Option<&ChangeLogEntry> {
        self.entries.iter().find(|e| e.entry_id == entry_id)
    }

    fn get_mut(&mut self, entry_id: EntryId) -> SyncResult<&mut ChangeLogEntry> {
        self.entries
            .iter_mut()
            .find(|e| e.entry_id == entry_id)
            .ok_or(SyncError::UnknownEntry(entry_id))
    }

    /// Marks an entry as accepted by the server.
    pub fn mark_transmitted(&mut self, entry_id: EntryId) -> SyncResult<()> {
        self.get_mut(entry_id)?.state = EntryState::Transmitted;
        Ok(())
    }

    /// Attaches a validation failure. The entry stays unsynced.
    pub fn mark_failed(&mut self, entry_id: EntryId, reason: impl Into<String>) -> SyncResult<()> {
        self.get_mut(entry_id)?.state = EntryState::Failed {
            reason: reason.into(),
        };
        self.sent.remove(&entry_id);
        Ok(())
    }

    /// Records that these entries went out in a push request.
    pub fn mark_sent(&mut self, ids: impl IntoIterator<Item = EntryId>) {
        self.sent.extend(ids);
    }

    /// Returns true if the entry was sent and no verdict has cleared it.
    pub fn was_sent(&self, entry_id: EntryId) -> bool {
        self.sent.contains(&entry_id)
    }

    /// Marks an entry as replaced.
    pub fn mark_superseded(&mut self, entry_id: EntryId) -> SyncResult<()> {
        self.get_mut(entry_id)?.state = EntryState::Superseded;
        Ok(())
    }

    /// Clears a validation failure so the entry is pushed again.
    pub fn retry(&mut self, entry_id: EntryId) -> SyncResult<()> {
        let entry = self.get_mut(entry_id)?;
        if matches!(entry.state, EntryState::Failed { .. }) {
            entry.state = EntryState::Pending;
        }
        Ok(())
    }

    /// Supersedes every unsynced entry of a record and returns them.
    pub fn supersede_unsynced(&mut self, record_id: RecordId) -> Vec<ChangeLogEntry> {
        let mut taken = Vec::new();
        for entry in &mut self.entries {
            if entry.record_id == record_id && entry.state.is_unsynced() {
                taken.push(entry.clone());
                entry.state = EntryState::Superseded;
            }
        }
        taken
    }

    /// Supersedes the queued (not in flight) unsynced entries of a record.
    pub fn supersede_queued(&mut self, record_id: RecordId) -> Vec<ChangeLogEntry> {
        let mut taken = Vec::new();
        for entry in &mut self.entries {
            if entry.record_id == record_id
                && entry.state.is_unsynced()
                && !self.in_flight.contains(&entry.entry_id)
            {
                taken.push(entry.clone());
                entry.state = EntryState::Superseded;
            }
        }
        taken
    }

    /// Supersedes the collapsible entries of a record and returns them.
    pub fn supersede_collapsible(&mut self, record_id: RecordId) -> Vec<ChangeLogEntry> {
        let mut taken = Vec::new();
        for entry in &mut self.entries {
            if entry.record_id == record_id
                && entry.state.is_unsynced()
                && !self.in_flight.contains(&entry.entry_id)
                && !self.sent.contains(&entry.entry_id)
            {
                taken.push(entry.clone());
                entry.state = EntryState::Superseded;
            }
        }
        taken
    }

    /// Records that these entries are part of an active push.
    pub fn begin_flight(&mut self, ids: impl IntoIterator<Item = EntryId>) {
        self.in_flight.extend(ids);
    }

    /// Clears the in-flight set.
    pub fn end_flight(&mut self) {
        self.in_flight.clear();
    }

    /// Returns true if the entry is part of an active push.
    pub fn is_in_flight(&self, entry_id: EntryId) -> bool {
        self.in_flight.contains(&entry_id)
    }

    /// Drops transmitted and superseded entries.
    pub fn compact(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.state.is_unsynced());
        let live: HashSet<EntryId> = self.entries.iter().map(|e| e.entry_id).collect();
        self.sent.retain(|id| live.contains(id));
        before - self.entries.len()
    }

    /// Number of pushable entries.
    pub fn pending_count(&self) -> usize {
        self.pending_entries().len()
    }

    /// Total number of entries, settled ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the log holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over all entries in append order.
    pub fn iter(&self) -> impl Iterator<Item = &ChangeLogEntry> {
        self.entries.iter()
    }
}
