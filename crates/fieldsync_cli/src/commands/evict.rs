//! Evict command implementation.

use super::{open_store, CliResult};
use fieldsync_engine::{EvictionConfig, EvictionManager, EvictionReport, Footprint};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Options for the evict command.
#[derive(Debug, Clone)]
pub struct EvictOptions {
    /// Capacity to free.
    pub target: usize,
    /// Total local capacity.
    pub capacity: usize,
    /// Measure payload bytes instead of slots.
    pub bytes: bool,
    /// Retention window in minutes.
    pub min_idle_minutes: u64,
    /// Plan only.
    pub dry_run: bool,
}

impl EvictOptions {
    fn config(&self) -> EvictionConfig {
        let footprint = if self.bytes {
            Footprint::PayloadBytes
        } else {
            Footprint::Slots
        };
        EvictionConfig::new(self.capacity)
            .with_footprint(footprint)
            .with_min_idle(Duration::from_secs(self.min_idle_minutes * 60))
    }
}

/// Runs the evict command.
pub fn run(path: &Path, options: &EvictOptions) -> CliResult<()> {
    info!("Evicting from {:?}", path);
    let store = open_store(path)?;
    let manager = EvictionManager::new(options.config());

    println!("Evicting from {:?}", path);
    if options.dry_run {
        println!("(dry run - no changes will be made)");
    }
    println!();

    let (usage, free) = store.read(|state| (manager.usage(state), manager.free(state)));
    println!("  Capacity: {}", options.capacity);
    println!("  Used:     {}", usage);
    println!("  Free:     {}", free);
    println!("  Target:   {}", options.target);
    println!();

    let report = if options.dry_run {
        let now = store.now();
        store.read(|state| manager.plan(state, options.target, now))
    } else {
        manager.evict(&store, options.target)?
    };
    print_report(&report, options.dry_run);
    Ok(())
}

fn print_report(report: &EvictionReport, dry_run: bool) {
    if report.evicted.is_empty() && !report.is_under_pressure() {
        println!("Nothing to evict - enough capacity is free");
        return;
    }

    let verb = if dry_run { "Would evict" } else { "Evicted" };
    println!("{} {} records, freeing {}", verb, report.evicted.len(), report.freed);
    for id in &report.evicted {
        println!("  {id}");
    }

    if let Some(pressure) = &report.pressure {
        println!();
        println!("Storage pressure:");
        println!("  Requested:      {}", pressure.requested);
        println!("  Available:      {}", pressure.available);
        println!("  Shortfall:      {}", pressure.shortfall());
        println!("  Held unsynced:  {}", pressure.unsynced_usage);
        println!("Unsynced records are never evicted; sync to release them.");
    }
}
