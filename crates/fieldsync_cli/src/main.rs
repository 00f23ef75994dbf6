//! fieldsync CLI
//!
//! Offline tools for a device state directory written by `fieldsync_engine`.
//!
//! # Commands
//!
//! - `inspect` - Display record, change log and conflict statistics
//! - `pending` - List pending entries in transmission order
//! - `conflicts` - List archived conflicts
//! - `evict` - Free capacity by dropping idle synced records
//! - `purge-conflicts` - Drop conflicts past the retention window

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// fieldsync device state tools.
#[derive(Parser)]
#[command(name = "fieldsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the device state directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display record, change log and conflict statistics
    Inspect {
        /// Include the session audit history
        #[arg(short, long)]
        sessions: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List pending entries in the order they would be pushed
    Pending {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List archived conflicts
    Conflicts {
        /// Show every archived conflict, not only those needing attention
        #[arg(short, long)]
        all: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Free capacity by evicting idle synced records
    Evict {
        /// Capacity to free, in footprint units
        #[arg(short, long)]
        target: usize,

        /// Total local capacity
        #[arg(short, long, default_value = "10000")]
        capacity: usize,

        /// Measure footprint in payload bytes instead of record slots
        #[arg(short, long)]
        bytes: bool,

        /// Minimum idle time before a record may be evicted, in minutes
        #[arg(short, long, default_value = "60")]
        min_idle: u64,

        /// Dry run - show what would be evicted
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Drop conflicts past the retention window
    PurgeConflicts {
        /// Retention window in days
        #[arg(short, long, default_value = "30")]
        retention_days: i64,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Inspect { sessions, format } => {
            let path = cli.path.ok_or("State path required for inspect")?;
            commands::inspect::run(&path, sessions, &format)?;
        }
        Commands::Pending { format } => {
            let path = cli.path.ok_or("State path required for pending")?;
            commands::pending::run(&path, &format)?;
        }
        Commands::Conflicts { all, format } => {
            let path = cli.path.ok_or("State path required for conflicts")?;
            commands::conflicts::run(&path, all, &format)?;
        }
        Commands::Evict {
            target,
            capacity,
            bytes,
            min_idle,
            dry_run,
        } => {
            let path = cli.path.ok_or("State path required for evict")?;
            let options = commands::evict::EvictOptions {
                target,
                capacity,
                bytes,
                min_idle_minutes: min_idle,
                dry_run,
            };
            commands::evict::run(&path, &options)?;
        }
        Commands::PurgeConflicts { retention_days } => {
            let path = cli.path.ok_or("State path required for purge-conflicts")?;
            commands::purge::run(&path, retention_days)?;
        }
        Commands::Version => {
            println!("fieldsync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("fieldsync engine v{}", fieldsync_engine::VERSION);
            println!("State format v{}", fieldsync_engine::FORMAT_VERSION);
        }
    }

    Ok(())
}
