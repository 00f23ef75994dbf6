//! Sync session coordination.
//!
//! One session runs at a time per coordinator. A session pulls server
//! changes, pushes scheduled change log entries in batches, resolves
//! rejected conflicts and commits everything to the local store in one
//! transaction. A failed session keeps every entry that was not confirmed
//! `accepted` pending.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::resolver::{ConflictResolver, Resolved, Verdict};
use crate::retry::with_retry;
use crate::scheduler::PriorityScheduler;
use crate::session::{
    SessionOutcome, SessionReport, SessionResult, SyncTrigger, ValidationFailure,
};
use crate::state::{SyncState, SyncStats};
use crate::store::{LocalStore, RemoteApply};
use crate::transport::SyncTransport;
use chrono::{DateTime, Utc};
use fieldsync_protocol::{
    ChangeLogEntry, Conflict, Disposition, EntryId, PullRequest, PushEntry, PushOutcome,
    PushRequest, PushResponse, RecordId, Resolution, SessionId, SyncRecord,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Extra push rounds for local conflict winners within one session.
const MAX_REBASE_ROUNDS: usize = 3;

/// Clears the single-flight flag when a session ends, however it ends.
struct ActiveGuard<'a>(&'a AtomicBool);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Results gathered before the commit.
#[derive(Default)]
struct SessionWork {
    pulled: Vec<SyncRecord>,
    server_time: Option<DateTime<Utc>>,
    pushed: usize,
    accepted: Vec<(EntryId, u64)>,
    rejected: Vec<(ChangeLogEntry, SyncRecord)>,
    validation_failures: Vec<ValidationFailure>,
    deferred: usize,
    resolutions: Vec<Resolved>,
    applied: Vec<Conflict>,
    push_error: Option<String>,
}

struct Session {
    id: SessionId,
    trigger: SyncTrigger,
    started_at: DateTime<Utc>,
    cursor: Option<DateTime<Utc>>,
    work: SessionWork,
}

impl Session {
    fn report(&self, finished_at: DateTime<Utc>, result: SessionResult) -> SessionReport {
        SessionReport {
            session_id: self.id,
            trigger: self.trigger,
            started_at: self.started_at,
            finished_at,
            last_sync_timestamp: self.cursor,
            pushed: self.work.pushed,
            accepted: self.work.accepted.len(),
            pulled: self.work.pulled.len(),
            conflicts: self
                .work
                .applied
                .iter()
                .cloned()
                .chain(self.work.resolutions.iter().map(|r| r.conflict.clone()))
                .collect(),
            validation_failures: self.work.validation_failures.clone(),
            deferred: self.work.deferred,
            consistency_violations: Vec::new(),
            result,
            error: self.work.push_error.clone(),
        }
    }
}

/// Drives sync sessions for one device.
pub struct SyncCoordinator<T: SyncTransport> {
    config: SyncConfig,
    store: Arc<LocalStore>,
    transport: Arc<T>,
    scheduler: PriorityScheduler,
    resolver: ConflictResolver,
    state: RwLock<SyncState>,
    stats: RwLock<SyncStats>,
    active: AtomicBool,
    cancel: Mutex<CancellationToken>,
}

impl<T: SyncTransport> SyncCoordinator<T> {
    /// Creates a coordinator.
    pub fn new(config: SyncConfig, store: Arc<LocalStore>, transport: T) -> Self {
        Self::with_transport(config, store, Arc::new(transport))
    }

    /// Creates a coordinator sharing an existing transport.
    pub fn with_transport(config: SyncConfig, store: Arc<LocalStore>, transport: Arc<T>) -> Self {
        Self {
            config,
            store,
            transport,
            scheduler: PriorityScheduler::new(),
            resolver: ConflictResolver::new(),
            state: RwLock::new(SyncState::Idle),
            stats: RwLock::new(SyncStats::default()),
            active: AtomicBool::new(false),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    /// Current state.
    pub fn state(&self) -> SyncState {
        *self.state.read()
    }

    /// Aggregated counters.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// The local store.
    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    /// The transport.
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Returns true while a session runs.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Cancels the running session, if any.
    ///
    /// Entries not yet confirmed `accepted` stay pending.
    pub fn cancel(&self) {
        self.cancel.lock().cancel();
    }

    /// Runs one session.
    ///
    /// Returns [`SessionOutcome::Coalesced`] if another session is active,
    /// and [`SyncError::NotConnected`] without starting a session if the
    /// server is unreachable. Transport failures and cancellation end the
    /// session as `failed` and are reported, not returned; only local
    /// storage failures surface as errors.
    pub async fn run_session(&self, trigger: SyncTrigger) -> SyncResult<SessionOutcome> {
        if self
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(%trigger, "session already active, trigger coalesced");
            self.stats.write().triggers_coalesced += 1;
            return Ok(SessionOutcome::Coalesced);
        }
        let _active = ActiveGuard(&self.active);

        if !self.transport.is_reachable() {
            debug!(%trigger, "server unreachable, session not started");
            return Err(SyncError::NotConnected);
        }

        let cancel = CancellationToken::new();
        *self.cancel.lock() = cancel.clone();

        let mut session = Session {
            id: SessionId::new(),
            trigger,
            started_at: self.store.now(),
            cursor: self.store.last_sync_timestamp(),
            work: SessionWork::default(),
        };
        info!(session_id = %session.id, %trigger, since = ?session.cursor, "session started");

        let outcome = self.drive(&mut session, &cancel).await;
        self.store.clear_in_flight();

        let report = match outcome {
            Ok(report) => report,
            Err(err) if err.is_fatal_local() => {
                self.enter_failed(session.id);
                error!(
                    session_id = %session.id,
                    error = %err,
                    "local storage failure, session aborted"
                );
                let mut stats = self.stats.write();
                stats.sessions_failed += 1;
                stats.last_error = Some(err.to_string());
                return Err(err);
            }
            Err(err) => self.abort(&mut session, err)?,
        };

        info!(
            session_id = %report.session_id,
            result = %report.result,
            pulled = report.pulled,
            pushed = report.pushed,
            accepted = report.accepted,
            conflicts = report.conflicts.len(),
            deferred = report.deferred,
            "session finished"
        );
        self.record_stats(&report);
        Ok(SessionOutcome::Completed(Box::new(report)))
    }

    /// Runs periodic sessions every `sync_interval` until `shutdown` fires.
    ///
    /// Shutdown cancels a running session and waits for it to wind down.
    pub async fn run_periodic(&self, shutdown: CancellationToken) {
        let Some(period) = self.config.sync_interval else {
            warn!("no sync interval configured, periodic sync disabled");
            return;
        };
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let session = self.run_session(SyncTrigger::Periodic);
            tokio::pin!(session);
            let outcome = tokio::select! {
                outcome = &mut session => outcome,
                () = shutdown.cancelled() => {
                    self.cancel();
                    session.await
                }
            };

            match outcome {
                Ok(_) => {}
                Err(SyncError::NotConnected) => debug!("server unreachable, waiting for next tick"),
                Err(err) => error!(error = %err, "periodic session failed"),
            }
        }
        info!("periodic sync stopped");
    }

    async fn drive(
        &self,
        session: &mut Session,
        cancel: &CancellationToken,
    ) -> SyncResult<SessionReport> {
        self.transition(session.id, SyncState::Pulling)?;
        self.pull_all(session, cancel).await?;

        self.transition(session.id, SyncState::Pushing)?;
        let ordered = self.store.begin_push(&self.scheduler);
        self.push_all(session, ordered, cancel).await?;

        let mut round = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            self.transition(session.id, SyncState::Reconciling)?;
            let rebased = self.reconcile(session)?;
            if rebased.is_empty() {
                break;
            }
            if round == MAX_REBASE_ROUNDS {
                warn!(
                    session_id = %session.id,
                    entries = rebased.len(),
                    "local winners still contested, deferring to next session"
                );
                session.work.deferred += rebased.len();
                break;
            }
            round += 1;
            debug!(
                session_id = %session.id,
                round,
                entries = rebased.len(),
                "pushing local winners"
            );
            self.transition(session.id, SyncState::Pushing)?;
            self.push_all(session, rebased, cancel).await?;
        }

        self.transition(session.id, SyncState::Committing)?;
        let report = self.commit(session)?;
        self.transition(session.id, SyncState::Idle)?;
        Ok(report)
    }

    /// Pulls every server change after the session cursor, page by page.
    async fn pull_all(&self, session: &mut Session, cancel: &CancellationToken) -> SyncResult<()> {
        let mut since = session.cursor;
        loop {
            let request = PullRequest::new(self.config.device_id, since);
            let response = with_retry(
                &self.config.retry,
                self.config.request_timeout,
                cancel,
                "pull",
                || self.transport.pull(&request),
            )
            .await?;
            debug!(
                session_id = %session.id,
                records = response.records.len(),
                server_time = %response.server_time,
                has_more = response.has_more,
                "pulled server changes"
            );

            let stalled = since == Some(response.server_time);
            since = Some(response.server_time);
            session.work.server_time = since;
            session.work.pulled.extend(response.records);
            if !response.has_more {
                return Ok(());
            }
            if stalled {
                return Err(SyncError::Protocol(
                    "pull reported more changes without advancing".into(),
                ));
            }
        }
    }

    /// Pushes entries in batches.
    ///
    /// A batch holds at most one entry per record, and only the earliest
    /// unsynced entry of each record, so the server sees every record's
    /// versions in order. After a rejection the record's later entries are
    /// deferred to the next session.
    async fn push_all(
        &self,
        session: &mut Session,
        ordered: Vec<ChangeLogEntry>,
        cancel: &CancellationToken,
    ) -> SyncResult<()> {
        let batch_size = self.config.push_batch_size.max(1);
        let mut remaining = ordered;
        let mut blocked: HashSet<RecordId> = HashSet::new();

        while !remaining.is_empty() {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            let mut lineage_head: HashMap<RecordId, u64> = HashMap::new();
            for entry in &remaining {
                let head = lineage_head.entry(entry.record_id).or_insert(entry.base_version);
                *head = (*head).min(entry.base_version);
            }

            let mut batch: Vec<ChangeLogEntry> = Vec::new();
            let mut in_batch: HashSet<RecordId> = HashSet::new();
            let mut rest = Vec::new();
            for entry in remaining {
                if blocked.contains(&entry.record_id) {
                    session.work.deferred += 1;
                    continue;
                }
                let eligible = batch.len() < batch_size
                    && !in_batch.contains(&entry.record_id)
                    && lineage_head.get(&entry.record_id) == Some(&entry.base_version);
                if eligible {
                    in_batch.insert(entry.record_id);
                    batch.push(entry);
                } else {
                    rest.push(entry);
                }
            }
            remaining = rest;

            if batch.is_empty() {
                session.work.deferred += remaining.len();
                break;
            }

            let ids: Vec<EntryId> = batch.iter().map(|e| e.entry_id).collect();
            self.store.mark_sent(&ids)?;
            let request = PushRequest::new(
                self.config.device_id,
                batch.iter().map(PushEntry::from).collect(),
            );
            let response = match with_retry(
                &self.config.retry,
                self.config.request_timeout,
                cancel,
                "push",
                || self.transport.push(&request),
            )
            .await
            {
                Ok(response) => response,
                Err(err) if err.is_retryable() => {
                    warn!(
                        session_id = %session.id,
                        batch = batch.len(),
                        remaining = remaining.len(),
                        error = %err,
                        "push retries exhausted, deferring remaining entries"
                    );
                    session.work.deferred += batch.len() + remaining.len();
                    session.work.push_error = Some(err.to_string());
                    break;
                }
                Err(err) => return Err(err),
            };

            session.work.pushed += batch.len();
            self.record_dispositions(session, batch, response, &mut blocked);
        }
        Ok(())
    }

    fn record_dispositions(
        &self,
        session: &mut Session,
        batch: Vec<ChangeLogEntry>,
        response: PushResponse,
        blocked: &mut HashSet<RecordId>,
    ) {
        let mut by_entry: HashMap<EntryId, Disposition> = HashMap::new();
        for disposition in response.dispositions {
            match disposition.validate() {
                Ok(()) => {
                    by_entry.insert(disposition.entry_id, disposition);
                }
                Err(err) => {
                    warn!(session_id = %session.id, error = %err, "ignoring malformed disposition");
                }
            }
        }

        for entry in batch {
            let Some(disposition) = by_entry.remove(&entry.entry_id) else {
                warn!(
                    session_id = %session.id,
                    entry_id = %entry.entry_id,
                    "no disposition for pushed entry, keeping it pending"
                );
                blocked.insert(entry.record_id);
                session.work.deferred += 1;
                continue;
            };

            match disposition.outcome {
                PushOutcome::Accepted => {
                    let version = disposition
                        .server_version
                        .unwrap_or(entry.base_version + 1);
                    session.work.accepted.push((entry.entry_id, version));
                }
                PushOutcome::RejectedConflict => {
                    blocked.insert(entry.record_id);
                    if let Some(server) = disposition.server_payload {
                        debug!(
                            session_id = %session.id,
                            record_id = %entry.record_id,
                            base_version = entry.base_version,
                            server_version = server.version,
                            "push rejected: conflict"
                        );
                        session.work.rejected.push((entry, server));
                    }
                }
                PushOutcome::RejectedValidation => {
                    blocked.insert(entry.record_id);
                    let reason = disposition
                        .reason
                        .unwrap_or_else(|| "rejected by server validation".to_string());
                    warn!(
                        session_id = %session.id,
                        record_id = %entry.record_id,
                        entry_id = %entry.entry_id,
                        reason = %reason,
                        "push rejected: validation"
                    );
                    session.work.validation_failures.push(ValidationFailure {
                        record_id: entry.record_id,
                        entry_id: entry.entry_id,
                        reason,
                    });
                }
            }
        }
    }

    /// Resolves rejected conflicts.
    ///
    /// Local winners are applied at once and their rebased entries returned
    /// so the session can push them before committing. Remote winners wait
    /// for the commit.
    fn reconcile(&self, session: &mut Session) -> SyncResult<Vec<ChangeLogEntry>> {
        let now = self.store.now();
        let mut local_winners = Vec::new();
        for (entry, server) in std::mem::take(&mut session.work.rejected) {
            let local = self
                .store
                .peek(entry.record_id)
                .map_or_else(|| entry.payload_snapshot.clone(), |r| r.record);

            match self.resolver.check(entry.base_version, &local, &server, now) {
                Verdict::Clean => {
                    warn!(
                        session_id = %session.id,
                        record_id = %entry.record_id,
                        "server rejected an entry at its own base version, keeping it pending"
                    );
                    session.work.deferred += 1;
                }
                Verdict::Conflict(resolved) => {
                    if resolved.requires_confirmation() {
                        info!(
                            session_id = %session.id,
                            record_id = %entry.record_id,
                            kind = ?resolved.conflict.kind,
                            "delete conflict needs confirmation"
                        );
                    }
                    if resolved.resolution == Resolution::LocalWins {
                        local_winners.push(*resolved);
                    } else {
                        session.work.resolutions.push(*resolved);
                    }
                }
            }
        }

        if local_winners.is_empty() {
            return Ok(Vec::new());
        }
        let conflicts: Vec<Conflict> = local_winners.iter().map(|r| r.conflict.clone()).collect();
        let rebased = self.store.rebase_winners(local_winners, &self.scheduler)?;
        session.work.applied.extend(conflicts);
        Ok(rebased)
    }

    fn commit(&self, session: &mut Session) -> SyncResult<SessionReport> {
        let work = &session.work;
        let awaiting = work.applied.iter().any(|c| c.requires_confirmation())
            || work.resolutions.iter().any(|r| r.requires_confirmation());
        let clean = work.validation_failures.is_empty()
            && work.deferred == 0
            && work.push_error.is_none()
            && !awaiting;
        let result = if clean {
            SessionResult::Success
        } else {
            SessionResult::Partial
        };
        let mut report = session.report(self.store.now(), result);

        let retention = self.config.conflict_retention_chrono();
        let keep = self.config.session_history;
        let work = std::mem::take(&mut session.work);

        self.store.transaction(move |txn| {
            for record in work.pulled {
                if let RemoteApply::Violation(violation) = txn.apply_remote(record) {
                    report.consistency_violations.push(violation);
                }
            }
            for (entry_id, version) in &work.accepted {
                txn.commit_accepted(*entry_id, *version)?;
            }
            for resolved in work.resolutions {
                txn.apply_resolution(resolved)?;
            }
            for failure in &work.validation_failures {
                txn.fail_entry(failure.entry_id, &failure.reason)?;
            }
            let purged = txn.purge_expired_conflicts(retention);
            txn.end_flight();
            let compacted = txn.compact();
            if let Some(server_time) = work.server_time {
                txn.set_last_sync_timestamp(server_time);
            }
            if !report.consistency_violations.is_empty() {
                report.result = SessionResult::Partial;
            }
            txn.record_session(report.summary(), keep);
            debug!(
                session_id = %report.session_id,
                purged,
                compacted,
                "session committed"
            );
            Ok(report)
        })
    }

    /// Ends a session as failed, keeping confirmed results.
    fn abort(&self, session: &mut Session, err: SyncError) -> SyncResult<SessionReport> {
        self.enter_failed(session.id);
        warn!(session_id = %session.id, error = %err, "session failed");

        let mut report = session.report(self.store.now(), SessionResult::Failed);
        report.conflicts = session.work.applied.clone();
        report.error = Some(err.to_string());

        let keep = self.config.session_history;
        let work = std::mem::take(&mut session.work);
        self.store.transaction(|txn| {
            for (entry_id, version) in &work.accepted {
                txn.commit_accepted(*entry_id, *version)?;
            }
            for failure in &work.validation_failures {
                txn.fail_entry(failure.entry_id, &failure.reason)?;
            }
            txn.end_flight();
            txn.record_session(report.summary(), keep);
            Ok(())
        })?;
        Ok(report)
    }

    fn transition(&self, session_id: SessionId, next: SyncState) -> SyncResult<()> {
        let mut state = self.state.write();
        if !state.can_transition_to(next) {
            return Err(SyncError::InvalidStateTransition {
                from: state.to_string(),
                to: next.to_string(),
            });
        }
        debug!(session_id = %session_id, from = %*state, to = %next, "state transition");
        *state = next;
        Ok(())
    }

    fn enter_failed(&self, session_id: SessionId) {
        let mut state = self.state.write();
        if state.is_active() {
            debug!(session_id = %session_id, from = %*state, "state transition to failed");
            *state = SyncState::Failed;
        }
    }

    fn record_stats(&self, report: &SessionReport) {
        let mut stats = self.stats.write();
        match report.result {
            SessionResult::Success => stats.sessions_succeeded += 1,
            SessionResult::Partial => stats.sessions_partial += 1,
            SessionResult::Failed => stats.sessions_failed += 1,
        }
        stats.entries_pushed += report.pushed as u64;
        stats.entries_accepted += report.accepted as u64;
        stats.records_pulled += report.pulled as u64;
        stats.conflicts_resolved += report.conflicts.len() as u64;
        stats.validation_failures += report.validation_failures.len() as u64;
        stats.consistency_violations += report.consistency_violations.len() as u64;
        stats.last_session_at = Some(report.finished_at);
        stats.last_error = report.error.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::RetryConfig;
    use crate::persist::MemoryStateStore;
    use crate::transport::MockTransport;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use fieldsync_protocol::{DeviceId, Operation, PullResponse, Resolution, SyncStatus};
    use std::time::Duration;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 3, 7, 30, 0).unwrap()
    }

    fn config() -> SyncConfig {
        SyncConfig::new(DeviceId::from_u128(7)).with_retry(RetryConfig::no_retry())
    }

    fn setup(transport: MockTransport) -> (SyncCoordinator<MockTransport>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start()));
        let store = Arc::new(LocalStore::in_memory_with_clock(clock.clone()));
        (SyncCoordinator::new(config(), store, transport), clock)
    }

    fn empty_pull() -> PullResponse {
        PullResponse::new(vec![], start() + ChronoDuration::hours(1))
    }

    async fn run(coordinator: &SyncCoordinator<MockTransport>) -> SessionReport {
        coordinator
            .run_session(SyncTrigger::Manual)
            .await
            .unwrap()
            .into_report()
            .unwrap()
    }

    #[tokio::test]
    async fn pushes_pending_entries_and_commits() {
        let (coordinator, _) = setup(MockTransport::accepting(empty_pull()));
        let store = coordinator.store().clone();
        let a = store.create("visit", b"north".to_vec(), true).unwrap();
        let b = store.create("visit", b"south".to_vec(), false).unwrap();

        let report = run(&coordinator).await;

        assert_eq!(report.result, SessionResult::Success);
        assert_eq!(report.pushed, 2);
        assert_eq!(report.accepted, 2);
        assert_eq!(coordinator.state(), SyncState::Idle);
        for id in [a.record_id, b.record_id] {
            let local = store.peek(id).unwrap();
            assert_eq!(local.sync_status, SyncStatus::Synced);
            assert_eq!(local.record.version, 1);
        }
        assert!(store.unsynced_entries().is_empty());
        assert_eq!(store.last_sync_timestamp(), Some(empty_pull().server_time));
        assert_eq!(store.sessions().len(), 1);
        assert_eq!(coordinator.stats().sessions_succeeded, 1);
    }

    #[tokio::test]
    async fn next_session_pulls_from_last_watermark() {
        let (coordinator, _) = setup(MockTransport::accepting(empty_pull()));
        run(&coordinator).await;
        run(&coordinator).await;

        let pulls = coordinator.transport().pull_requests();
        assert_eq!(pulls[0].since, None);
        assert_eq!(pulls[1].since, Some(empty_pull().server_time));
    }

    #[tokio::test]
    async fn entries_of_one_record_go_out_in_order() {
        let (coordinator, _) = setup(MockTransport::accepting(empty_pull()));
        let store = coordinator.store().clone();
        let created = store.create("visit", b"v1".to_vec(), false).unwrap();
        store.update(created.record_id, b"v2".to_vec(), false).unwrap();

        let report = run(&coordinator).await;

        let pushes = coordinator.transport().push_requests();
        assert_eq!(pushes.len(), 2);
        assert_eq!(pushes[0].entries[0].operation, Operation::Create);
        assert_eq!(pushes[1].entries[0].operation, Operation::Update);
        assert_eq!(pushes[1].entries[0].base_version, 1);
        assert_eq!(report.accepted, 2);
        assert_eq!(store.peek(created.record_id).unwrap().record.version, 2);
    }

    #[tokio::test]
    async fn batches_respect_batch_size() {
        let clock = Arc::new(ManualClock::new(start()));
        let store = Arc::new(LocalStore::in_memory_with_clock(clock));
        let coordinator = SyncCoordinator::new(
            config().with_push_batch_size(2),
            store.clone(),
            MockTransport::accepting(empty_pull()),
        );
        for i in 0..5u8 {
            store.create("visit", vec![i], false).unwrap();
        }

        run(&coordinator).await;

        let sizes: Vec<usize> = coordinator
            .transport()
            .push_requests()
            .iter()
            .map(|r| r.entries.len())
            .collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[tokio::test]
    async fn unreachable_server_starts_no_session() {
        let transport = MockTransport::accepting(empty_pull());
        transport.set_reachable(false);
        let (coordinator, _) = setup(transport);

        let err = coordinator.run_session(SyncTrigger::ConnectivityRestored).await.unwrap_err();

        assert_eq!(err, SyncError::NotConnected);
        assert_eq!(coordinator.state(), SyncState::Idle);
        assert!(coordinator.transport().pull_requests().is_empty());
        assert!(!coordinator.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_trigger_is_coalesced() {
        let transport = MockTransport::accepting(empty_pull());
        transport.set_delay(Some(Duration::from_millis(200)));
        let (coordinator, _) = setup(transport);

        let (first, second) = tokio::join!(
            coordinator.run_session(SyncTrigger::Manual),
            coordinator.run_session(SyncTrigger::Periodic),
        );

        assert!(first.unwrap().report().is_some());
        assert_eq!(second.unwrap(), SessionOutcome::Coalesced);
        assert_eq!(coordinator.transport().pull_requests().len(), 1);
        assert_eq!(coordinator.stats().triggers_coalesced, 1);
    }

    #[tokio::test]
    async fn failed_pull_keeps_entries_pending() {
        let transport = MockTransport::accepting(empty_pull());
        transport.queue_pull(Err(SyncError::transport_retryable("connection reset")));
        let (coordinator, _) = setup(transport);
        let store = coordinator.store().clone();
        store.create("visit", b"x".to_vec(), false).unwrap();

        let report = run(&coordinator).await;

        assert_eq!(report.result, SessionResult::Failed);
        assert!(report.error.unwrap().contains("connection reset"));
        assert_eq!(coordinator.state(), SyncState::Failed);
        assert!(coordinator.transport().push_requests().is_empty());
        assert_eq!(store.pending_entries().len(), 1);
        assert_eq!(store.last_sync_timestamp(), None);

        // A failed coordinator can start over.
        let report = run(&coordinator).await;
        assert_eq!(report.result, SessionResult::Success);
        assert!(store.pending_entries().is_empty());
    }

    #[tokio::test]
    async fn exhausted_push_defers_and_reports_partial() {
        let transport = MockTransport::accepting(empty_pull());
        transport.queue_push(Err(SyncError::Timeout));
        let (coordinator, _) = setup(transport);
        let store = coordinator.store().clone();
        store.create("visit", b"x".to_vec(), false).unwrap();

        let report = run(&coordinator).await;

        assert_eq!(report.result, SessionResult::Partial);
        assert_eq!(report.deferred, 1);
        assert_eq!(report.accepted, 0);
        assert_eq!(coordinator.state(), SyncState::Idle);
        assert_eq!(store.pending_entries().len(), 1);
        assert_eq!(store.last_sync_timestamp(), Some(empty_pull().server_time));
    }

    #[tokio::test]
    async fn validation_rejection_marks_entry_failed() {
        let transport = MockTransport::new();
        transport.set_pull_response(empty_pull());
        transport.set_push_handler(|request| {
            Ok(PushResponse::new(
                request
                    .entries
                    .iter()
                    .map(|e| Disposition::validation(e, "quantity must be positive"))
                    .collect(),
            ))
        });
        let (coordinator, _) = setup(transport);
        let store = coordinator.store().clone();
        let entry = store.create("stock", b"-3".to_vec(), false).unwrap();

        let report = run(&coordinator).await;

        assert_eq!(report.result, SessionResult::Partial);
        assert_eq!(report.validation_failures.len(), 1);
        assert_eq!(report.validation_failures[0].entry_id, entry.entry_id);
        let unsynced = store.unsynced_entries();
        assert_eq!(unsynced.len(), 1);
        assert_eq!(unsynced[0].failure_reason(), Some("quantity must be positive"));
        assert!(store.pending_entries().is_empty());
        assert_eq!(store.peek(entry.record_id).unwrap().sync_status, SyncStatus::Pending);
    }

    #[tokio::test]
    async fn later_remote_update_wins_conflict() {
        let (coordinator, clock) = setup(MockTransport::accepting(empty_pull()));
        let store = coordinator.store().clone();
        let created = store.create("job", b"draft".to_vec(), false).unwrap();
        run(&coordinator).await;

        clock.advance(ChronoDuration::minutes(1));
        store.update(created.record_id, b"local edit".to_vec(), false).unwrap();
        let server = SyncRecord::new(
            created.record_id,
            "job",
            2,
            start() + ChronoDuration::minutes(2),
            b"office edit".to_vec(),
        );
        coordinator.transport().set_push_handler(move |request| {
            Ok(PushResponse::new(
                request
                    .entries
                    .iter()
                    .map(|e| Disposition::conflict(e, server.clone()))
                    .collect(),
            ))
        });

        let report = run(&coordinator).await;

        assert_eq!(report.result, SessionResult::Success);
        assert_eq!(report.conflicts.len(), 1);
        assert_eq!(report.conflicts[0].resolution, Resolution::RemoteWins);
        let local = store.peek(created.record_id).unwrap();
        assert_eq!(local.record.payload, b"office edit".to_vec());
        assert_eq!(local.record.version, 2);
        assert_eq!(local.sync_status, SyncStatus::Synced);
        assert!(store.unsynced_entries().is_empty());
        assert_eq!(store.conflicts().len(), 1);
    }

    #[tokio::test]
    async fn pull_follows_pages_until_complete() {
        let transport = MockTransport::accepting(empty_pull());
        let first_page = start() + ChronoDuration::minutes(10);
        let remote =
            |n: u128| SyncRecord::new(RecordId::from_u128(n), "visit", 1, start(), vec![1]);
        transport.queue_pull(Ok(
            PullResponse::new(vec![remote(1), remote(2)], first_page).with_has_more(true)
        ));
        transport.queue_pull(Ok(PullResponse::new(vec![remote(3)], empty_pull().server_time)));
        let (coordinator, _) = setup(transport);
        let store = coordinator.store().clone();

        let report = run(&coordinator).await;

        assert_eq!(report.result, SessionResult::Success);
        assert_eq!(report.pulled, 3);
        let pulls = coordinator.transport().pull_requests();
        assert_eq!(pulls.len(), 2);
        assert_eq!(pulls[1].since, Some(first_page));
        assert_eq!(store.read(|s| s.records.len()), 3);
        assert_eq!(store.last_sync_timestamp(), Some(empty_pull().server_time));
    }

    #[tokio::test]
    async fn pull_that_never_advances_fails_the_session() {
        let transport = MockTransport::new();
        transport.set_pull_response(empty_pull().with_has_more(true));
        let (coordinator, _) = setup(transport);

        let report = run(&coordinator).await;

        assert_eq!(report.result, SessionResult::Failed);
        assert_eq!(coordinator.transport().pull_requests().len(), 2);
        assert_eq!(coordinator.store().last_sync_timestamp(), None);
    }

    #[tokio::test]
    async fn local_winner_is_pushed_in_the_same_session() {
        let (coordinator, clock) = setup(MockTransport::accepting(empty_pull()));
        let store = coordinator.store().clone();
        let created = store.create("job", b"draft".to_vec(), false).unwrap();
        run(&coordinator).await;

        clock.advance(ChronoDuration::minutes(3));
        let edit = store.update(created.record_id, b"field edit".to_vec(), false).unwrap();
        let server = SyncRecord::new(
            created.record_id,
            "job",
            2,
            start() + ChronoDuration::minutes(2),
            b"office edit".to_vec(),
        );
        coordinator.transport().queue_push(Ok(PushResponse::new(vec![Disposition::conflict(
            &PushEntry::from(&edit),
            server,
        )])));

        let report = run(&coordinator).await;

        assert_eq!(report.result, SessionResult::Success);
        assert_eq!(report.conflicts.len(), 1);
        assert_eq!(report.conflicts[0].resolution, Resolution::LocalWins);
        assert_eq!(report.pushed, 2);
        assert_eq!(report.accepted, 1);
        let pushes = coordinator.transport().push_requests();
        let rebased = &pushes.last().unwrap().entries[0];
        assert_eq!(rebased.base_version, 2);
        assert_eq!(rebased.operation, Operation::Update);

        let local = store.peek(created.record_id).unwrap();
        assert_eq!(local.sync_status, SyncStatus::Synced);
        assert_eq!(local.record.version, 3);
        assert_eq!(local.record.payload, b"field edit".to_vec());
        assert!(store.unsynced_entries().is_empty());
        assert_eq!(coordinator.state(), SyncState::Idle);

        let again = run(&coordinator).await;
        assert_eq!(again.pushed, 0);
        assert!(again.conflicts.is_empty());
        assert_eq!(store.conflicts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn edit_during_push_gets_a_fresh_entry() {
        let (coordinator, _) = setup(MockTransport::accepting(empty_pull()));
        let store = coordinator.store().clone();
        let created = store.create("visit", b"v1".to_vec(), false).unwrap();
        run(&coordinator).await;
        let sent = store.update(created.record_id, b"v2".to_vec(), false).unwrap();
        coordinator.transport().set_delay(Some(Duration::from_secs(10)));

        // Pull takes 10s, then the push of `sent` is in flight until 20s.
        let edit = async {
            tokio::time::sleep(Duration::from_secs(15)).await;
            store.update(created.record_id, b"v3".to_vec(), false).unwrap()
        };
        let (outcome, follow_up) =
            tokio::join!(coordinator.run_session(SyncTrigger::Manual), edit);

        let report = outcome.unwrap().into_report().unwrap();
        assert_eq!(report.accepted, 1);
        assert_eq!(sent.base_version, 1);
        assert_eq!(follow_up.operation, Operation::Update);
        assert_eq!(follow_up.base_version, 2);
        let unsynced = store.unsynced_entries();
        assert_eq!(unsynced.len(), 1);
        assert_eq!(unsynced[0].entry_id, follow_up.entry_id);
        let local = store.peek(created.record_id).unwrap();
        assert_eq!(local.sync_status, SyncStatus::Pending);
        assert_eq!(local.record.payload, b"v3".to_vec());

        let report = run(&coordinator).await;
        assert_eq!(report.accepted, 1);
        let local = store.peek(created.record_id).unwrap();
        assert_eq!(local.sync_status, SyncStatus::Synced);
        assert_eq!(local.record.version, 3);
        assert_eq!(local.record.payload, b"v3".to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_fails_session_without_losing_work() {
        let transport = MockTransport::accepting(empty_pull());
        transport.set_delay(Some(Duration::from_secs(10)));
        let (coordinator, _) = setup(transport);
        let store = coordinator.store().clone();
        store.create("visit", b"x".to_vec(), false).unwrap();

        let (outcome, ()) = tokio::join!(coordinator.run_session(SyncTrigger::Manual), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            coordinator.cancel();
        });

        let report = outcome.unwrap().into_report().unwrap();
        assert_eq!(report.result, SessionResult::Failed);
        assert_eq!(report.error.as_deref(), Some("sync cancelled"));
        assert_eq!(coordinator.state(), SyncState::Failed);
        assert_eq!(store.pending_entries().len(), 1);
        assert_eq!(coordinator.stats().sessions_failed, 1);
    }

    #[tokio::test]
    async fn storage_failure_during_session_is_returned() {
        let backend = Arc::new(MemoryStateStore::new());
        let clock = Arc::new(ManualClock::new(start()));
        let store = Arc::new(LocalStore::open(Box::new(backend.clone()), clock).unwrap());
        store.create("visit", b"x".to_vec(), false).unwrap();
        let coordinator =
            SyncCoordinator::new(config(), store.clone(), MockTransport::accepting(empty_pull()));

        backend.set_fail_writes(true);
        let err = coordinator.run_session(SyncTrigger::Manual).await.unwrap_err();

        assert!(err.is_fatal_local());
        assert_eq!(coordinator.state(), SyncState::Failed);
        assert!(coordinator.transport().push_requests().is_empty());
        assert_eq!(store.pending_entries().len(), 1);
        assert_eq!(store.last_sync_timestamp(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_sync_runs_until_shutdown() {
        let clock = Arc::new(ManualClock::new(start()));
        let store = Arc::new(LocalStore::in_memory_with_clock(clock));
        let coordinator = SyncCoordinator::new(
            config().with_sync_interval(Duration::from_secs(60)),
            store,
            MockTransport::accepting(empty_pull()),
        );
        let shutdown = CancellationToken::new();

        tokio::join!(coordinator.run_periodic(shutdown.clone()), async {
            tokio::time::sleep(Duration::from_secs(150)).await;
            shutdown.cancel();
        });

        // Ticks at 0s, 60s and 120s.
        assert_eq!(coordinator.transport().pull_requests().len(), 3);
        assert_eq!(coordinator.stats().sessions_succeeded, 3);
    }
}
