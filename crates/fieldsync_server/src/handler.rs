//! Request handlers for sync endpoints.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::store::AuthoritativeStore;
use crate::validation::PayloadValidator;
use chrono::{DateTime, Utc};
use fieldsync_protocol::{
    DeviceId, Disposition, PullRequest, PullResponse, PushOutcome, PushRequest, PushResponse,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Per-device request counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceActivity {
    /// Watermark returned by the device's last pull.
    pub last_pull: Option<DateTime<Utc>>,
    /// Entries received.
    pub pushed: u64,
    /// Entries accepted.
    pub accepted: u64,
    /// Entries rejected as conflicts.
    pub conflicts: u64,
    /// Entries rejected by validation.
    pub rejected: u64,
}

/// Context for request handling.
pub struct HandlerContext {
    /// Server configuration.
    pub config: ServerConfig,
    /// Authoritative store (shared across all handlers).
    pub store: Arc<AuthoritativeStore>,
    validator: Box<dyn PayloadValidator>,
    devices: RwLock<HashMap<DeviceId, DeviceActivity>>,
}

impl HandlerContext {
    /// Creates a new handler context.
    pub fn new(
        config: ServerConfig,
        store: Arc<AuthoritativeStore>,
        validator: Box<dyn PayloadValidator>,
    ) -> Self {
        Self {
            config,
            store,
            validator,
            devices: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the counters of one device.
    pub fn activity(&self, device_id: DeviceId) -> Option<DeviceActivity> {
        self.devices.read().get(&device_id).cloned()
    }

    fn record_pull(&self, device_id: DeviceId, watermark: DateTime<Utc>) {
        self.devices.write().entry(device_id).or_default().last_pull = Some(watermark);
    }

    fn record_push(&self, device_id: DeviceId, dispositions: &[Disposition]) {
        let mut devices = self.devices.write();
        let activity = devices.entry(device_id).or_default();
        activity.pushed += dispositions.len() as u64;
        for disposition in dispositions {
            match disposition.outcome {
                PushOutcome::Accepted => activity.accepted += 1,
                PushOutcome::RejectedConflict => activity.conflicts += 1,
                PushOutcome::RejectedValidation => activity.rejected += 1,
            }
        }
    }
}

/// Handler for sync requests.
pub struct RequestHandler {
    context: Arc<HandlerContext>,
}

impl RequestHandler {
    /// Creates a new request handler.
    pub fn new(context: Arc<HandlerContext>) -> Self {
        Self { context }
    }

    /// Handles a pull request.
    pub fn handle_pull(&self, request: PullRequest) -> ServerResult<PullResponse> {
        let batch = self
            .context
            .store
            .pull(request.since, self.context.config.max_pull_records);
        debug!(
            device_id = %request.device_id,
            since = ?request.since,
            records = batch.records.len(),
            watermark = %batch.watermark,
            has_more = batch.has_more,
            "pull"
        );
        self.context.record_pull(request.device_id, batch.watermark);
        Ok(PullResponse::new(batch.records, batch.watermark).with_has_more(batch.has_more))
    }

    /// Handles a push request.
    ///
    /// Entries are applied in request order, each with its own
    /// compare-and-set. Every entry gets exactly one disposition.
    pub fn handle_push(&self, request: PushRequest) -> ServerResult<PushResponse> {
        let max = self.context.config.max_push_batch;
        if request.entries.len() > max {
            warn!(
                device_id = %request.device_id,
                size = request.entries.len(),
                max,
                "push batch too large"
            );
            return Err(ServerError::BatchTooLarge {
                size: request.entries.len(),
                max,
            });
        }

        let dispositions: Vec<Disposition> = request
            .entries
            .iter()
            .map(|entry| match self.context.validator.validate(entry) {
                Ok(()) => self.context.store.compare_and_set(request.device_id, entry),
                Err(reason) => {
                    info!(
                        device_id = %request.device_id,
                        record_id = %entry.record_id,
                        reason = %reason,
                        "entry rejected by validation"
                    );
                    Disposition::validation(entry, reason)
                }
            })
            .collect();

        self.context.record_push(request.device_id, &dispositions);
        Ok(PushResponse::new(dispositions))
    }
}
