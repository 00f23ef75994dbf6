//! Authoritative record store.
//!
//! Each record lives in its own slot behind its own mutex, so writes to
//! different records never contend. Compare-and-set on the slot is the only
//! write path for device pushes.
//!
//! Every accepted write is stamped with a strictly increasing commit time.
//! Stamps are issued and written under the commit clock, so once a pull has
//! read the clock every write stamped at or before that watermark is
//! visible. Pull returns records committed in `(since, watermark]`.

use chrono::{DateTime, Duration, Utc};
use fieldsync_protocol::{
    DeviceId, Disposition, EntryId, Operation, PushEntry, RecordId, SyncRecord,
};
use parking_lot::{Mutex, RwLock};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

type TimeSource = Box<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Debug, Clone)]
struct Slot {
    record: SyncRecord,
    committed_at: DateTime<Utc>,
    last_entry: Option<EntryId>,
    last_writer: Option<DeviceId>,
}

/// A committed record together with its commit metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedRecord {
    /// Current server version, tombstones included.
    pub record: SyncRecord,
    /// Server commit time of this version.
    pub committed_at: DateTime<Utc>,
    /// Device that wrote this version. `None` for direct server writes.
    pub last_writer: Option<DeviceId>,
}

/// Records changed since a watermark.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullBatch {
    /// Changed records in commit order.
    pub records: Vec<SyncRecord>,
    /// Upper bound of the batch. Pass it as `since` on the next pull.
    pub watermark: DateTime<Utc>,
    /// The batch was truncated at the limit.
    pub has_more: bool,
}

/// The authoritative copy of every record.
pub struct AuthoritativeStore {
    slots: RwLock<HashMap<RecordId, Arc<Mutex<Slot>>>>,
    commit_clock: Mutex<DateTime<Utc>>,
    now: TimeSource,
}

impl std::fmt::Debug for AuthoritativeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthoritativeStore")
            .field("records", &self.slots.read().len())
            .field("watermark", &*self.commit_clock.lock())
            .finish_non_exhaustive()
    }
}

impl Default for AuthoritativeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthoritativeStore {
    /// Creates an empty store on the system clock.
    pub fn new() -> Self {
        Self::with_time_source(Utc::now)
    }

    /// Creates an empty store reading time from `now`.
    pub fn with_time_source<F>(now: F) -> Self
    where
        F: Fn() -> DateTime<Utc> + Send + Sync + 'static,
    {
        Self {
            slots: RwLock::new(HashMap::new()),
            commit_clock: Mutex::new(DateTime::<Utc>::UNIX_EPOCH),
            now: Box::new(now),
        }
    }

    /// Issues the next commit stamp. Callers hold the commit clock.
    fn next_stamp(&self, last: &mut DateTime<Utc>) -> DateTime<Utc> {
        let candidate = (self.now)();
        let stamp = if candidate > *last {
            candidate
        } else {
            *last + Duration::microseconds(1)
        };
        *last = stamp;
        stamp
    }

    /// Applies a pushed entry if the server still holds its base version.
    ///
    /// - absent record: a create based on version 0 is written at
    ///   version 1; anything else is a validation rejection
    /// - replay of the entry that produced the current version: accepted
    ///   again at the current version
    /// - current version equals the base: written at `base + 1`
    /// - otherwise: conflict carrying the current server record
    pub fn compare_and_set(&self, device: DeviceId, entry: &PushEntry) -> Disposition {
        let existing = self.slots.read().get(&entry.record_id).cloned();
        let slot = match existing {
            Some(slot) => slot,
            None => {
                if entry.operation != Operation::Create || entry.base_version != 0 {
                    return Disposition::validation(
                        entry,
                        format!("record {} does not exist on the server", entry.record_id),
                    );
                }
                let mut slots = self.slots.write();
                match slots.entry(entry.record_id) {
                    Entry::Occupied(occupied) => Arc::clone(occupied.get()),
                    Entry::Vacant(vacant) => {
                        let mut clock = self.commit_clock.lock();
                        let committed_at = self.next_stamp(&mut clock);
                        let record = written(entry, 1);
                        vacant.insert(Arc::new(Mutex::new(Slot {
                            record,
                            committed_at,
                            last_entry: Some(entry.entry_id),
                            last_writer: Some(device),
                        })));
                        debug!(record_id = %entry.record_id, %device, "record created");
                        return Disposition::accepted(entry, 1);
                    }
                }
            }
        };

        let mut slot = slot.lock();
        if slot.last_entry == Some(entry.entry_id) {
            trace!(entry_id = %entry.entry_id, "replayed entry accepted again");
            return Disposition::accepted(entry, slot.record.version);
        }
        if slot.record.version != entry.base_version {
            debug!(
                record_id = %entry.record_id,
                %device,
                base_version = entry.base_version,
                server_version = slot.record.version,
                "compare-and-set conflict"
            );
            return Disposition::conflict(entry, slot.record.clone());
        }

        let version = entry.base_version + 1;
        let mut clock = self.commit_clock.lock();
        slot.committed_at = self.next_stamp(&mut clock);
        slot.record = written(entry, version);
        slot.last_entry = Some(entry.entry_id);
        slot.last_writer = Some(device);
        debug!(record_id = %entry.record_id, %device, version, "record written");
        Disposition::accepted(entry, version)
    }

    /// Writes a record directly, bypassing compare-and-set.
    ///
    /// Models edits made on the server side (back office, imports). The
    /// version advances past the current one.
    pub fn write_direct(&self, mut record: SyncRecord) -> SyncRecord {
        let mut slots = self.slots.write();
        match slots.entry(record.id) {
            Entry::Occupied(occupied) => {
                let mut slot = occupied.get().lock();
                record.version = slot.record.version + 1;
                let mut clock = self.commit_clock.lock();
                slot.committed_at = self.next_stamp(&mut clock);
                slot.record = record.clone();
                slot.last_entry = None;
                slot.last_writer = None;
            }
            Entry::Vacant(vacant) => {
                record.version = record.version.max(1);
                let mut clock = self.commit_clock.lock();
                let committed_at = self.next_stamp(&mut clock);
                vacant.insert(Arc::new(Mutex::new(Slot {
                    record: record.clone(),
                    committed_at,
                    last_entry: None,
                    last_writer: None,
                })));
            }
        }
        debug!(record_id = %record.id, version = record.version, "direct write");
        record
    }

    /// Returns records committed after `since`, at most `limit` of them.
    ///
    /// When the limit truncates the batch, the watermark is the commit time
    /// of the last record returned, so the next pull resumes right after it.
    pub fn pull(&self, since: Option<DateTime<Utc>>, limit: usize) -> PullBatch {
        let watermark = *self.commit_clock.lock();
        let slots: Vec<Arc<Mutex<Slot>>> = self.slots.read().values().cloned().collect();

        let mut changed: Vec<(DateTime<Utc>, SyncRecord)> = slots
            .iter()
            .filter_map(|slot| {
                let slot = slot.lock();
                let after = since.map_or(true, |since| slot.committed_at > since);
                (after && slot.committed_at <= watermark)
                    .then(|| (slot.committed_at, slot.record.clone()))
            })
            .collect();
        changed.sort_by_key(|(at, _)| *at);

        let limit = limit.max(1);
        let has_more = changed.len() > limit;
        let watermark = if has_more {
            changed.truncate(limit);
            changed.last().map_or(watermark, |(at, _)| *at)
        } else {
            watermark
        };

        PullBatch {
            records: changed.into_iter().map(|(_, r)| r).collect(),
            watermark,
            has_more,
        }
    }

    /// Returns the current version of a record.
    pub fn get(&self, id: RecordId) -> Option<CommittedRecord> {
        let slot = self.slots.read().get(&id).cloned()?;
        let slot = slot.lock();
        Some(CommittedRecord {
            record: slot.record.clone(),
            committed_at: slot.committed_at,
            last_writer: slot.last_writer,
        })
    }

    /// Returns every record, tombstones included, ordered by id.
    pub fn records(&self) -> Vec<SyncRecord> {
        let slots: Vec<Arc<Mutex<Slot>>> = self.slots.read().values().cloned().collect();
        let mut records: Vec<SyncRecord> = slots.iter().map(|s| s.lock().record.clone()).collect();
        records.sort_by_key(|r| r.id);
        records
    }

    /// Number of records, tombstones included.
    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    /// Returns true if no record was ever written.
    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }

    /// Latest commit stamp.
    pub fn watermark(&self) -> DateTime<Utc> {
        *self.commit_clock.lock()
    }
}

/// The record as stored after accepting `entry` at `version`.
fn written(entry: &PushEntry, version: u64) -> SyncRecord {
    let mut record = entry.payload.clone();
    record.version = version;
    record.deleted = entry.operation.is_delete();
    record
}
