//! Conflicts command implementation.

use super::{open_store, CliResult, Format};
use fieldsync_protocol::{Conflict, ConflictKind, ConflictState, Resolution};
use std::path::Path;

/// Runs the conflicts command.
pub fn run(path: &Path, show_all: bool, format: &str) -> CliResult<()> {
    let format = Format::parse(format)?;
    let store = open_store(path)?;
    let conflicts = if show_all {
        store.conflicts()
    } else {
        store.conflicts_requiring_attention()
    };

    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&conflicts)?),
        Format::Text => print_text_output(&conflicts, show_all),
    }
    Ok(())
}

fn print_text_output(conflicts: &[Conflict], show_all: bool) {
    if conflicts.is_empty() {
        if show_all {
            println!("No archived conflicts");
        } else {
            println!("No conflicts need attention");
        }
        return;
    }

    println!("Conflicts ({}):", conflicts.len());
    for c in conflicts {
        println!();
        println!("  {}", c.id);
        println!("    record:     {}", c.record_id);
        println!("    kind:       {}", kind_name(c.kind));
        println!(
            "    resolution: {} (local v{}, remote v{})",
            resolution_name(c.resolution),
            c.local_version,
            c.remote_version
        );
        println!("    state:      {}", state_name(c.state));
        println!("    resolved:   {}", c.resolved_at.to_rfc3339());
        println!(
            "    losing:     {}",
            if c.losing.deleted {
                "tombstone".to_string()
            } else {
                format!("{} bytes, updated {}", c.losing.payload_size(), c.losing.updated_at)
            }
        );
        if !c.notified_user {
            println!("    not yet shown to the user");
        }
    }
}

fn kind_name(kind: ConflictKind) -> &'static str {
    match kind {
        ConflictKind::UpdateUpdate => "update/update",
        ConflictKind::LocalDelete => "local delete vs remote update",
        ConflictKind::RemoteDelete => "local update vs remote delete",
        ConflictKind::DeleteDelete => "delete/delete",
    }
}

fn resolution_name(resolution: Resolution) -> &'static str {
    match resolution {
        Resolution::LocalWins => "local wins",
        Resolution::RemoteWins => "remote wins",
    }
}

fn state_name(state: ConflictState) -> &'static str {
    match state {
        ConflictState::AutoResolved => "auto-resolved",
        ConflictState::AwaitingConfirmation => "awaiting confirmation",
        ConflictState::Confirmed => "confirmed",
        ConflictState::Overridden => "overridden",
    }
}
