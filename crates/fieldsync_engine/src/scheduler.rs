//! Push ordering.
//!
//! The scheduler is a pure function over a snapshot of pending entries. It
//! never mutates the change log.

use fieldsync_protocol::{ChangeLogEntry, RecordId};
use std::cmp::Ordering;
use std::collections::HashMap;

/// Orders pending entries for transmission.
///
/// Rules, in precedence order:
///
/// 1. Entries whose record has `critical_complete` set go first.
/// 2. Within a priority class, older `created_at` goes first.
/// 3. A delete is transmitted before any create or update of the same
///    record in the same push set.
///
/// Remaining ties break on operation (deletes first) and then entry id, so
/// the order is total and stable for identical input.
#[derive(Debug, Clone, Copy, Default)]
pub struct PriorityScheduler;

impl PriorityScheduler {
    /// Creates a scheduler.
    pub fn new() -> Self {
        Self
    }

    /// Orders entries. `is_critical` reports the current flag of a record;
    /// records it does not know fall back to the entry's snapshot.
    pub fn order<'a, F>(
        &self,
        entries: &[&'a ChangeLogEntry],
        is_critical: F,
    ) -> Vec<&'a ChangeLogEntry>
    where
        F: Fn(RecordId) -> Option<bool>,
    {
        let mut critical: HashMap<RecordId, bool> = HashMap::new();
        for e in entries {
            let flag = is_critical(e.record_id).unwrap_or(e.payload_snapshot.critical_complete);
            *critical.entry(e.record_id).or_insert(false) |= flag;
        }

        let mut sorted: Vec<&ChangeLogEntry> = entries.to_vec();
        sorted.sort_by(|a, b| {
            let ca = critical.get(&a.record_id).copied().unwrap_or(false);
            let cb = critical.get(&b.record_id).copied().unwrap_or(false);
            cb.cmp(&ca)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| delete_first(a, b))
                .then_with(|| a.entry_id.cmp(&b.entry_id))
        });

        hoist_deletes(sorted)
    }
}

fn delete_first(a: &ChangeLogEntry, b: &ChangeLogEntry) -> Ordering {
    b.operation.is_delete().cmp(&a.operation.is_delete())
}

/// Moves each delete in front of the first entry of its record.
fn hoist_deletes(sorted: Vec<&ChangeLogEntry>) -> Vec<&ChangeLogEntry> {
    let mut out: Vec<&ChangeLogEntry> = Vec::with_capacity(sorted.len());
    let mut first_slot: HashMap<RecordId, usize> = HashMap::new();

    for entry in sorted {
        match first_slot.get(&entry.record_id).copied() {
            Some(slot) if entry.operation.is_delete() => {
                out.insert(slot, entry);
                for pos in first_slot.values_mut() {
                    if *pos > slot {
                        *pos += 1;
                    }
                }
            }
            Some(_) => out.push(entry),
            None => {
                first_slot.insert(entry.record_id, out.len());
                out.push(entry);
            }
        }
    }
    out
}
