//! Purge-conflicts command implementation.

use super::{open_store, CliResult};
use std::path::Path;
use tracing::info;

/// Runs the purge-conflicts command.
pub fn run(path: &Path, retention_days: i64) -> CliResult<()> {
    info!("Purging conflicts older than {} days from {:?}", retention_days, path);
    let store = open_store(path)?;
    let before = store.conflicts().len();
    let removed = store.purge_expired_conflicts(chrono::Duration::days(retention_days.max(0)))?;

    println!("Purged {removed} of {before} archived conflicts older than {retention_days} days");
    let kept = store.conflicts().iter().filter(|c| c.requires_confirmation()).count();
    if kept > 0 {
        println!("{kept} conflicts still await confirmation and are never purged");
    }
    Ok(())
}
