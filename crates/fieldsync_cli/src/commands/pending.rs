//! Pending command implementation.

use super::{open_store, CliResult, Format};
use chrono::{DateTime, Utc};
use fieldsync_engine::{DeviceState, PriorityScheduler};
use fieldsync_protocol::{EntryId, EntryState, Operation, RecordId};
use serde::Serialize;
use std::path::Path;

/// One row of the pending listing.
#[derive(Debug, Serialize)]
pub struct PendingRow {
    /// Entry id.
    pub entry_id: EntryId,
    /// Target record.
    pub record_id: RecordId,
    /// Entity type.
    pub entity_type: String,
    /// Mutation kind.
    pub operation: Operation,
    /// Server version the entry builds on.
    pub base_version: u64,
    /// Local commit time.
    pub created_at: DateTime<Utc>,
    /// Whether the record is critical-complete.
    pub critical: bool,
}

/// An entry held back by a validation failure.
#[derive(Debug, Serialize)]
pub struct FailedRow {
    /// Entry id.
    pub entry_id: EntryId,
    /// Target record.
    pub record_id: RecordId,
    /// Server-supplied reason.
    pub reason: String,
}

/// Pending entries in transmission order plus failed ones.
#[derive(Debug, Serialize)]
pub struct PendingListing {
    /// Pushable entries, scheduler order.
    pub pending: Vec<PendingRow>,
    /// Entries rejected by validation.
    pub failed: Vec<FailedRow>,
}

impl PendingListing {
    fn from_state(state: &DeviceState) -> Self {
        let entries = state.change_log.pending_entries();
        let ordered = PriorityScheduler::new().order(&entries, |id| state.is_critical(id));
        let pending = ordered
            .into_iter()
            .map(|e| PendingRow {
                entry_id: e.entry_id,
                record_id: e.record_id,
                entity_type: e.entity_type.clone(),
                operation: e.operation,
                base_version: e.base_version,
                created_at: e.created_at,
                critical: state
                    .is_critical(e.record_id)
                    .unwrap_or(e.payload_snapshot.critical_complete),
            })
            .collect();
        let failed = state
            .change_log
            .unsynced_entries()
            .filter_map(|e| match &e.state {
                EntryState::Failed { reason } => Some(FailedRow {
                    entry_id: e.entry_id,
                    record_id: e.record_id,
                    reason: reason.clone(),
                }),
                _ => None,
            })
            .collect();
        Self { pending, failed }
    }
}

/// Runs the pending command.
pub fn run(path: &Path, format: &str) -> CliResult<()> {
    let format = Format::parse(format)?;
    let store = open_store(path)?;
    let listing = store.read(PendingListing::from_state);

    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&listing)?),
        Format::Text => print_text_output(&listing),
    }
    Ok(())
}

fn print_text_output(listing: &PendingListing) {
    if listing.pending.is_empty() {
        println!("No pending entries");
    } else {
        println!("Pending entries ({}), in push order:", listing.pending.len());
        for (pos, row) in listing.pending.iter().enumerate() {
            println!(
                "  {:>3}. {} {:<6} {} base={} {} {}{}",
                pos + 1,
                row.created_at.format("%Y-%m-%d %H:%M:%S"),
                operation_name(row.operation),
                row.record_id,
                row.base_version,
                row.entity_type,
                row.entry_id,
                if row.critical { " [critical]" } else { "" }
            );
        }
    }

    if !listing.failed.is_empty() {
        println!();
        println!("Rejected by validation ({}):", listing.failed.len());
        for row in &listing.failed {
            println!("  {} {}: {}", row.entry_id, row.record_id, row.reason);
        }
    }
}

fn operation_name(operation: Operation) -> &'static str {
    match operation {
        Operation::Create => "create",
        Operation::Update => "update",
        Operation::Delete => "delete",
    }
}
