//! Property-based test generators using proptest.
//!
//! Provides strategies for generating records, change log entries and
//! device operation scripts.

use crate::fixtures::base_time;
use chrono::{DateTime, Duration, Utc};
use fieldsync_protocol::{ChangeLogEntry, Operation, RecordId, SyncRecord};
use proptest::prelude::*;

/// Strategy for record ids drawn from a small pool, so collisions happen.
pub fn record_id_strategy(pool: u128) -> impl Strategy<Value = RecordId> {
    (1..=pool.max(1)).prop_map(RecordId::from_u128)
}

/// Strategy for timestamps within thirty days after [`base_time`], at
/// second resolution so equal timestamps occur.
pub fn timestamp_strategy() -> impl Strategy<Value = DateTime<Utc>> {
    prop_oneof![
        (0i64..120).prop_map(|s| base_time() + Duration::seconds(s)),
        (0i64..30 * 86_400).prop_map(|s| base_time() + Duration::seconds(s)),
    ]
}

/// Strategy for non-empty payloads.
pub fn payload_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 1..48)
}

/// Strategy for entity type names.
pub fn entity_type_strategy() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["visit", "inspection", "meter-reading", "work-order"])
        .prop_map(str::to_string)
}

/// Strategy for records, tombstones included.
pub fn record_strategy() -> impl Strategy<Value = SyncRecord> {
    (
        record_id_strategy(8),
        entity_type_strategy(),
        1u64..12,
        timestamp_strategy(),
        payload_strategy(),
        any::<bool>(),
        prop::bool::weighted(0.25),
    )
        .prop_map(|(id, entity_type, version, at, payload, critical, deleted)| {
            let record = SyncRecord::new(id, entity_type, version, at, payload)
                .with_critical_complete(critical);
            if deleted {
                record.tombstone(version, at)
            } else {
                record
            }
        })
}

/// Strategy for two diverged versions of one record, as `(local, remote)`.
pub fn record_pair_strategy() -> impl Strategy<Value = (SyncRecord, SyncRecord)> {
    (record_strategy(), record_strategy()).prop_map(|(local, mut remote)| {
        remote.id = local.id;
        remote.entity_type = local.entity_type.clone();
        (local, remote)
    })
}

/// Strategy for pending change log entries.
pub fn entry_strategy() -> impl Strategy<Value = ChangeLogEntry> {
    (
        record_strategy(),
        prop::sample::select(vec![Operation::Create, Operation::Update, Operation::Delete]),
        timestamp_strategy(),
    )
        .prop_map(|(record, operation, created_at)| {
            let snapshot = if operation.is_delete() {
                record.tombstone(record.version, record.updated_at)
            } else {
                SyncRecord {
                    deleted: false,
                    ..record
                }
            };
            let base = snapshot.version - 1;
            ChangeLogEntry::new(operation, snapshot, base, created_at)
        })
}

/// Strategy for a batch of pending entries over a few records.
pub fn entry_batch_strategy(max: usize) -> impl Strategy<Value = Vec<ChangeLogEntry>> {
    prop::collection::vec(entry_strategy(), 0..=max)
}

/// One step of a simulated device session.
#[derive(Debug, Clone)]
pub enum DeviceOp {
    /// Create a record.
    Create {
        /// Payload.
        payload: Vec<u8>,
        /// Critical-complete flag.
        critical: bool,
    },
    /// Update the n-th known record (modulo the number of records).
    Update {
        /// Target index.
        target: usize,
        /// Payload.
        payload: Vec<u8>,
    },
    /// Delete the n-th known record.
    Delete {
        /// Target index.
        target: usize,
    },
    /// Advance the clock by some minutes.
    Advance(i64),
    /// Run a session.
    Sync,
    /// Run a session whose first `n` requests fail.
    SyncFailing(usize),
    /// Run a session whose push responses are lost after the server
    /// applied them.
    SyncLosingResponses,
}

/// Strategy for device operation scripts.
pub fn device_script_strategy(len: usize) -> impl Strategy<Value = Vec<DeviceOp>> {
    let op = prop_oneof![
        4 => (payload_strategy(), any::<bool>())
            .prop_map(|(payload, critical)| DeviceOp::Create { payload, critical }),
        4 => (any::<usize>(), payload_strategy())
            .prop_map(|(target, payload)| DeviceOp::Update { target, payload }),
        1 => any::<usize>().prop_map(|target| DeviceOp::Delete { target }),
        2 => (1i64..90).prop_map(DeviceOp::Advance),
        2 => Just(DeviceOp::Sync),
        1 => (1usize..4).prop_map(DeviceOp::SyncFailing),
        1 => Just(DeviceOp::SyncLosingResponses),
    ];
    prop::collection::vec(op, 1..=len.max(1))
}
