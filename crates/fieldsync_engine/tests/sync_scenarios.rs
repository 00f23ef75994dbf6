//! End-to-end sync scenarios against an in-process server.

use chrono::Duration;
use fieldsync_engine::{SessionResult, SyncError, SyncState, SyncTrigger};
use fieldsync_protocol::{ConflictKind, Operation, Resolution, SyncStatus};
use fieldsync_server::{ServerConfig, SyncServer};
use fieldsync_testkit::prelude::*;
use std::sync::Arc;

#[tokio::test]
async fn later_remote_update_wins_and_conflict_is_archived() {
    let server = test_server();
    let a = TestDevice::new(&server, 1);
    let b = TestDevice::new(&server, 2);

    let id = a.store.create("inspection", b"v1".to_vec(), false).unwrap().record_id;
    a.sync().await;
    a.store.update(id, b"v2".to_vec(), false).unwrap();
    a.store.update(id, b"v3".to_vec(), false).unwrap();
    a.sync().await;
    assert_eq!(server.store().get(id).unwrap().record.version, 3);

    b.sync().await;
    assert_eq!(b.store.peek(id).unwrap().record.version, 3);

    // B edits offline; A edits later and reaches the server first.
    b.advance(Duration::minutes(1));
    b.store.update(id, b"b offline".to_vec(), false).unwrap();
    a.advance(Duration::minutes(2));
    a.store.update(id, b"a online".to_vec(), false).unwrap();
    assert_eq!(a.sync().await.accepted, 1);

    let report = b.sync().await;
    assert_eq!(report.result, SessionResult::Success);
    assert_eq!(report.accepted, 0);
    assert_eq!(report.conflicts.len(), 1);
    let conflict = &report.conflicts[0];
    assert_eq!(conflict.resolution, Resolution::RemoteWins);
    assert_eq!(conflict.kind, ConflictKind::UpdateUpdate);
    assert_eq!(conflict.local_version, 4);
    assert_eq!(conflict.remote_version, 4);
    assert_eq!(conflict.losing.payload, b"b offline".to_vec());

    let local = b.store.peek(id).unwrap();
    assert_eq!(local.sync_status, SyncStatus::Synced);
    assert_eq!(local.record.version, 4);
    assert_eq!(local.record.payload, b"a online".to_vec());
    assert!(b.store.unsynced_entries().is_empty());
    assert_eq!(b.store.conflicts().len(), 1);
    assert_eq!(b.coordinator.state(), SyncState::Idle);
}

#[tokio::test]
async fn second_session_changes_nothing() {
    let server = test_server();
    let a = TestDevice::new(&server, 1);
    let b = TestDevice::new(&server, 2);
    a.store.create("visit", b"north field".to_vec(), true).unwrap();
    a.store.create("visit", b"south field".to_vec(), false).unwrap();
    a.sync().await;
    b.store.create("visit", b"east field".to_vec(), false).unwrap();
    b.sync().await;

    a.sync().await;
    let before = a.store.snapshot();
    let report = a.sync().await;
    let after = a.store.snapshot();

    assert_eq!(report.pulled, 0);
    assert_eq!(report.pushed, 0);
    assert_eq!(report.result, SessionResult::Success);
    assert_eq!(after.records, before.records);
    assert_eq!(after.conflicts, before.conflicts);
    assert_eq!(after.change_log.len(), before.change_log.len());
    assert_eq!(after.records.len(), 3);
}

#[tokio::test]
async fn later_local_edit_wins_and_reaches_server_in_one_session() {
    let server = test_server();
    let a = TestDevice::new(&server, 1);
    let b = TestDevice::new(&server, 2);
    let id = a.store.create("job", b"draft".to_vec(), false).unwrap().record_id;
    a.sync().await;
    b.sync().await;

    a.advance(Duration::minutes(1));
    a.store.update(id, b"a".to_vec(), false).unwrap();
    assert_eq!(a.sync().await.accepted, 1);
    b.advance(Duration::minutes(2));
    b.store.update(id, b"b".to_vec(), false).unwrap();

    let report = b.sync().await;
    assert_eq!(report.result, SessionResult::Success);
    assert_eq!(report.conflicts.len(), 1);
    assert_eq!(report.conflicts[0].resolution, Resolution::LocalWins);
    assert_eq!(report.accepted, 1);
    let committed = server.store().get(id).unwrap().record;
    assert_eq!(committed.payload, b"b".to_vec());
    assert_eq!(committed.version, 3);
    let local = b.store.peek(id).unwrap();
    assert_eq!(local.sync_status, SyncStatus::Synced);
    assert_eq!(local.record, committed);
    assert!(b.store.unsynced_entries().is_empty());

    let before = b.store.snapshot();
    let again = b.sync().await;
    assert_eq!(again.pushed, 0);
    assert!(again.conflicts.is_empty());
    assert_eq!(b.store.snapshot().records, before.records);
    assert_eq!(b.store.snapshot().change_log.len(), before.change_log.len());

    a.sync().await;
    assert_eq!(a.store.peek(id).unwrap().record, committed);
}

#[tokio::test]
async fn truncated_pulls_are_followed_to_the_end() {
    let server = Arc::new(SyncServer::new(ServerConfig::new().with_max_pull_records(2)));
    let a = TestDevice::new(&server, 1);
    let b = TestDevice::new(&server, 2);
    for i in 0..5u8 {
        a.store.create("visit", vec![b'0' + i], false).unwrap();
    }
    assert_eq!(a.sync().await.accepted, 5);

    let report = b.sync().await;
    assert_eq!(report.result, SessionResult::Success);
    assert_eq!(report.pulled, 5);
    assert_eq!(b.store.read(|s| s.records.len()), server.record_count());

    let again = b.sync().await;
    assert_eq!(again.pulled, 0);
}

#[tokio::test]
async fn lost_push_response_is_replayed_without_duplicates() {
    let server = test_server();
    let device = TestDevice::new(&server, 1);
    let entry = device.store.create("meter-reading", b"1043 kWh".to_vec(), true).unwrap();

    device.endpoint().lose_push_responses(1);
    let report = device.sync().await;
    assert_eq!(report.result, SessionResult::Partial);
    assert_eq!(report.deferred, 1);
    assert!(report.error.unwrap().contains("connection closed"));
    assert_eq!(server.record_count(), 1);
    assert_eq!(device.store.unsynced_entries().len(), 1);

    let report = device.sync().await;
    assert_eq!(report.result, SessionResult::Success);
    assert_eq!(report.accepted, 1);
    assert_eq!(server.record_count(), 1);
    assert_eq!(server.store().get(entry.record_id).unwrap().record.version, 1);
    let local = device.store.peek(entry.record_id).unwrap();
    assert_eq!(local.sync_status, SyncStatus::Synced);
    assert_eq!(local.record.version, 1);
}

#[tokio::test]
async fn delete_after_lost_create_response_reaches_server() {
    let server = test_server();
    let device = TestDevice::new(&server, 1);
    let created = device.store.create("work-order", b"replace valve".to_vec(), false).unwrap();

    device.endpoint().lose_push_responses(1);
    device.sync().await;
    assert_eq!(server.record_count(), 1);

    // The create may already be applied, so the delete must not elide it.
    let delete = device.store.delete(created.record_id).unwrap().unwrap();
    assert_eq!(delete.base_version, 1);

    let report = device.sync().await;
    assert_eq!(report.accepted, 2);
    let committed = server.store().get(created.record_id).unwrap();
    assert!(committed.record.deleted);
    assert_eq!(committed.record.version, 2);
    assert!(device.store.peek(created.record_id).is_none());
}

#[tokio::test]
async fn concurrent_edits_converge_on_latest_write() {
    let server = test_server();
    let a = TestDevice::new(&server, 1);
    let b = TestDevice::new(&server, 2);
    let id = a.store.create("inventory", b"10 bags".to_vec(), false).unwrap().record_id;
    a.sync().await;
    b.sync().await;

    a.store.update(id, b"12 bags".to_vec(), false).unwrap();
    b.advance(Duration::minutes(5));
    b.store.update(id, b"9 bags".to_vec(), false).unwrap();
    tokio::join!(a.sync(), b.sync());

    b.sync().await;
    a.sync().await;

    let server_copy = server.store().get(id).unwrap().record;
    assert_eq!(server_copy.payload, b"9 bags".to_vec());
    assert_eq!(a.store.peek(id).unwrap().record, server_copy);
    assert_eq!(b.store.peek(id).unwrap().record, server_copy);
    assert_eq!(a.store.conflicts().len() + b.store.conflicts().len(), 1);
    assert!(a.store.unsynced_entries().is_empty());
    assert!(b.store.unsynced_entries().is_empty());
}

#[tokio::test]
async fn validation_failure_is_fixed_by_next_edit() {
    let server = test_server();
    let device = TestDevice::new(&server, 1);
    let created = device.store.create("measurement", vec![], false).unwrap();

    let report = device.sync().await;
    assert_eq!(report.result, SessionResult::Partial);
    assert_eq!(report.validation_failures.len(), 1);
    assert!(report.validation_failures[0].reason.contains("empty"));
    assert!(server.store().is_empty());
    let failed = device.store.unsynced_entries().remove(0);
    assert_eq!(failed.failure_reason(), Some(report.validation_failures[0].reason.as_str()));

    let fixed = device.store.update(created.record_id, b"72 kg".to_vec(), true).unwrap();
    assert_eq!(fixed.operation, Operation::Create);
    assert_eq!(device.store.unsynced_entries().len(), 1);

    let report = device.sync().await;
    assert_eq!(report.result, SessionResult::Success);
    assert_eq!(server.store().get(created.record_id).unwrap().record.payload, b"72 kg".to_vec());
    assert_eq!(device.store.peek(created.record_id).unwrap().sync_status, SyncStatus::Synced);
}

#[tokio::test]
async fn failed_session_keeps_work_for_the_next_one() {
    let server = test_server();
    let device = TestDevice::new(&server, 1);
    device.store.create("visit", b"clinic".to_vec(), true).unwrap();

    device.endpoint().fail_next(1);
    let report = device.sync().await;
    assert_eq!(report.result, SessionResult::Failed);
    assert!(report.error.is_some());
    assert_eq!(device.coordinator.state(), SyncState::Failed);
    assert_eq!(device.store.pending_entries().len(), 1);
    assert!(server.store().is_empty());

    let report = device.sync().await;
    assert_eq!(report.result, SessionResult::Success);
    assert_eq!(server.record_count(), 1);
    assert_eq!(device.coordinator.stats().sessions_failed, 1);
}

#[tokio::test]
async fn offline_device_starts_no_session() {
    let server = test_server();
    let device = TestDevice::new(&server, 1);
    device.store.create("visit", b"ward 3".to_vec(), false).unwrap();
    device.set_online(false);

    let err = device.coordinator.run_session(SyncTrigger::ConnectivityRestored).await;
    assert_eq!(err.unwrap_err(), SyncError::NotConnected);
    assert!(device.store.sessions().is_empty());

    device.set_online(true);
    let report = device.sync().await;
    assert_eq!(report.accepted, 1);
}

#[tokio::test]
async fn pending_work_survives_restart() {
    let server = test_server();
    let dir = TempStateDir::new();
    let clock = test_clock();

    let id = {
        let store = dir.open(clock.clone());
        store.create("work-order", b"inspect pump".to_vec(), true).unwrap().record_id
    };

    let store = Arc::new(dir.open(clock.clone()));
    assert_eq!(store.pending_entries().len(), 1);
    let device = TestDevice::with_store(&server, test_config(1), store, clock);
    assert_eq!(device.sync().await.accepted, 1);
    drop(device);

    let reopened = dir.open(test_clock());
    assert!(reopened.unsynced_entries().is_empty());
    assert_eq!(reopened.peek(id).unwrap().sync_status, SyncStatus::Synced);
    assert_eq!(reopened.sessions().len(), 1);
    assert!(reopened.last_sync_timestamp().is_some());
}
