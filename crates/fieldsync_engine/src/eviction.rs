//! Storage eviction.
//!
//! Only synced records idle for longer than the retention window are
//! candidates. Pending and conflict records are never evicted; when the
//! candidates cannot free enough space the manager stops short and reports
//! storage pressure.

use crate::config::{EvictionConfig, Footprint};
use crate::error::SyncResult;
use crate::store::{DeviceState, LocalRecord, LocalStore};
use chrono::{DateTime, Utc};
use fieldsync_protocol::{RecordId, SyncStatus};
use tracing::{info, warn};

/// Raised when synced candidates cannot satisfy an eviction target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoragePressure {
    /// Requested free capacity.
    pub requested: usize,
    /// Free capacity after eviction.
    pub available: usize,
    /// Capacity held by unsynced records.
    pub unsynced_usage: usize,
}

impl StoragePressure {
    /// Capacity still missing.
    pub fn shortfall(&self) -> usize {
        self.requested.saturating_sub(self.available)
    }
}

/// Result of an eviction pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    /// Evicted record ids, oldest access first.
    pub evicted: Vec<RecordId>,
    /// Capacity freed.
    pub freed: usize,
    /// Set when the target was not met.
    pub pressure: Option<StoragePressure>,
}

impl EvictionReport {
    /// Returns true if the target could not be met.
    pub fn is_under_pressure(&self) -> bool {
        self.pressure.is_some()
    }
}

/// Frees local capacity by dropping stale synced records.
#[derive(Debug, Clone)]
pub struct EvictionManager {
    config: EvictionConfig,
}

impl EvictionManager {
    /// Creates a manager.
    pub fn new(config: EvictionConfig) -> Self {
        Self { config }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &EvictionConfig {
        &self.config
    }

    fn footprint(&self, record: &LocalRecord) -> usize {
        match self.config.footprint {
            Footprint::Slots => 1,
            Footprint::PayloadBytes => record.record.payload_size(),
        }
    }

    /// Capacity currently in use.
    pub fn usage(&self, state: &DeviceState) -> usize {
        state.records.values().map(|r| self.footprint(r)).sum()
    }

    /// Free capacity.
    pub fn free(&self, state: &DeviceState) -> usize {
        self.config.capacity.saturating_sub(self.usage(state))
    }

    /// Computes which records to evict so that `target_free` capacity is
    /// available. Does not modify anything.
    pub fn plan(
        &self,
        state: &DeviceState,
        target_free: usize,
        now: DateTime<Utc>,
    ) -> EvictionReport {
        let free = self.free(state);
        if free >= target_free {
            return EvictionReport::default();
        }
        let needed = target_free - free;
        let min_idle = chrono::Duration::from_std(self.config.min_idle)
            .unwrap_or_else(|_| chrono::Duration::zero());

        let mut candidates: Vec<&LocalRecord> = state
            .records
            .values()
            .filter(|r| r.sync_status == SyncStatus::Synced)
            .filter(|r| !state.change_log.has_unsynced(r.id()))
            .filter(|r| now.signed_duration_since(r.last_accessed_at) > min_idle)
            .collect();
        candidates.sort_by(|a, b| {
            a.last_accessed_at
                .cmp(&b.last_accessed_at)
                .then_with(|| a.id().cmp(&b.id()))
        });

        let mut report = EvictionReport::default();
        for candidate in candidates {
            if report.freed >= needed {
                break;
            }
            report.freed += self.footprint(candidate);
            report.evicted.push(candidate.id());
        }

        if report.freed < needed {
            let unsynced_usage = state
                .records
                .values()
                .filter(|r| r.sync_status.is_unsynced())
                .map(|r| self.footprint(r))
                .sum();
            report.pressure = Some(StoragePressure {
                requested: target_free,
                available: free + report.freed,
                unsynced_usage,
            });
        }
        report
    }

    /// Evicts records from `store` until `target_free` capacity is free or
    /// the candidates run out.
    pub fn evict(&self, store: &LocalStore, target_free: usize) -> SyncResult<EvictionReport> {
        let report = store.transaction(|txn| {
            let report = self.plan(txn.state(), target_free, txn.now());
            txn.remove_records(&report.evicted);
            Ok(report)
        })?;

        if !report.evicted.is_empty() {
            info!(evicted = report.evicted.len(), freed = report.freed, "evicted synced records");
        }
        if let Some(pressure) = report.pressure {
            warn!(
                requested = pressure.requested,
                available = pressure.available,
                shortfall = pressure.shortfall(),
                unsynced_usage = pressure.unsynced_usage,
                "storage pressure: unsynced data holds the remaining capacity"
            );
        }
        Ok(report)
    }
}
