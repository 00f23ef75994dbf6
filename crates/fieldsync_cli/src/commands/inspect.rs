//! Inspect command implementation.

use super::{open_store, CliResult, Format};
use chrono::{DateTime, Utc};
use fieldsync_engine::{DeviceState, SessionSummary};
use fieldsync_protocol::EntryState;
use serde::Serialize;
use std::path::Path;

/// Device state inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// State directory.
    pub path: String,
    /// Records held locally, tombstones included.
    pub records: usize,
    /// Records matching a server version.
    pub synced: usize,
    /// Records with unconfirmed local changes.
    pub pending: usize,
    /// Records awaiting a conflict decision.
    pub conflict: usize,
    /// Local deletes not yet accepted.
    pub tombstones: usize,
    /// Total payload bytes.
    pub payload_bytes: usize,
    /// Change log entries, settled ones included.
    pub change_log_entries: usize,
    /// Entries waiting to be pushed.
    pub pending_entries: usize,
    /// Entries rejected by validation.
    pub failed_entries: usize,
    /// Archived conflicts.
    pub conflicts_archived: usize,
    /// Conflicts awaiting confirmation.
    pub conflicts_awaiting: usize,
    /// Flagged consistency violations.
    pub violations: usize,
    /// Pull cursor of the last committed session.
    pub last_sync_timestamp: Option<DateTime<Utc>>,
    /// Session audit history (if requested).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sessions: Option<Vec<SessionSummary>>,
}

impl InspectResult {
    fn from_state(path: &Path, state: &DeviceState, with_sessions: bool) -> Self {
        let (synced, pending, conflict) = state.status_counts();
        Self {
            path: path.display().to_string(),
            records: state.records.len(),
            synced,
            pending,
            conflict,
            tombstones: state.records.values().filter(|r| r.record.deleted).count(),
            payload_bytes: state.records.values().map(|r| r.record.payload_size()).sum(),
            change_log_entries: state.change_log.len(),
            pending_entries: state.change_log.pending_count(),
            failed_entries: state
                .change_log
                .unsynced_entries()
                .filter(|e| matches!(e.state, EntryState::Failed { .. }))
                .count(),
            conflicts_archived: state.conflicts.len(),
            conflicts_awaiting: state
                .conflicts
                .iter()
                .filter(|c| c.requires_confirmation())
                .count(),
            violations: state.violations.len(),
            last_sync_timestamp: state.last_sync_timestamp,
            sessions: with_sessions.then(|| state.sessions.iter().cloned().collect()),
        }
    }
}

/// Runs the inspect command.
pub fn run(path: &Path, show_sessions: bool, format: &str) -> CliResult<()> {
    let format = Format::parse(format)?;
    let store = open_store(path)?;
    let result = store.read(|state| InspectResult::from_state(path, state, show_sessions));

    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&result)?),
        Format::Text => print_text_output(&result),
    }
    Ok(())
}

fn print_text_output(result: &InspectResult) {
    println!("fieldsync Device State");
    println!("======================");
    println!();
    println!("Path: {}", result.path);
    match result.last_sync_timestamp {
        Some(at) => println!("Last sync: {}", at.to_rfc3339()),
        None => println!("Last sync: never"),
    }
    println!();
    println!("Records:");
    println!("  Total:       {}", result.records);
    println!("  Synced:      {}", result.synced);
    println!("  Pending:     {}", result.pending);
    println!("  Conflict:    {}", result.conflict);
    println!("  Tombstones:  {}", result.tombstones);
    println!("  Payload:     {}", format_size(result.payload_bytes));
    println!();
    println!("Change log:");
    println!("  Entries:     {}", result.change_log_entries);
    println!("  Pending:     {}", result.pending_entries);
    println!("  Failed:      {}", result.failed_entries);
    println!();
    println!("Conflicts:");
    println!("  Archived:    {}", result.conflicts_archived);
    println!("  Awaiting:    {}", result.conflicts_awaiting);
    if result.violations > 0 {
        println!();
        println!("Consistency violations: {}", result.violations);
    }

    if let Some(sessions) = &result.sessions {
        println!();
        println!("Sessions:");
        for s in sessions {
            println!(
                "  {} {:<22} {:<8} pushed={} accepted={} pulled={} conflicts={} deferred={}",
                s.started_at.format("%Y-%m-%d %H:%M:%S"),
                s.trigger.to_string(),
                s.result.to_string(),
                s.pushed,
                s.accepted,
                s.pulled,
                s.conflicts,
                s.deferred
            );
            if let Some(error) = &s.error {
                println!("      error: {error}");
            }
        }
    }
}

fn format_size(bytes: usize) -> String {
    if bytes < 1024 {
        format!("{bytes} bytes")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_support::seed;
    use tempfile::TempDir;

    #[test]
    fn counts_seeded_state() {
        let dir = TempDir::new().unwrap();
        let store = seed(dir.path());
        let result = store.read(|state| InspectResult::from_state(dir.path(), state, false));

        assert_eq!(result.records, 2);
        assert_eq!(result.pending, 2);
        assert_eq!(result.pending_entries, 2);
        assert_eq!(result.payload_bytes, 12);
        assert!(result.last_sync_timestamp.is_none());
        assert!(result.sessions.is_none());
    }

    #[test]
    fn json_omits_sessions_unless_requested() {
        let dir = TempDir::new().unwrap();
        let store = seed(dir.path());
        let result = store.read(|state| InspectResult::from_state(dir.path(), state, false));
        let json = serde_json::to_string(&result).unwrap();
        assert!(!json.contains("sessions"));
        assert!(json.contains("\"pending_entries\":2"));
    }

    #[test]
    fn size_formatting() {
        assert_eq!(format_size(512), "512 bytes");
        assert_eq!(format_size(2048), "2.0 KB");
    }
}
