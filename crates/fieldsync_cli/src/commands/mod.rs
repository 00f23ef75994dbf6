//! CLI command implementations.

pub mod conflicts;
pub mod evict;
pub mod inspect;
pub mod pending;
pub mod purge;

use fieldsync_engine::{FileStateStore, LocalStore, SyncError, SystemClock};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Errors reported by CLI commands.
#[derive(Debug, Error)]
pub enum CliError {
    /// No state directory at the given path.
    #[error("no device state found at {}", .0.display())]
    NoState(PathBuf),

    /// Unknown `--format` value.
    #[error("unknown output format '{0}' (expected text or json)")]
    UnknownFormat(String),

    /// Engine failure.
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// JSON output failure.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Result type for CLI commands.
pub type CliResult<T> = Result<T, CliError>;

/// Output format of listing commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// Human-readable text.
    Text,
    /// Pretty-printed JSON.
    Json,
}

impl Format {
    /// Parses a `--format` value.
    pub fn parse(value: &str) -> CliResult<Self> {
        match value {
            "text" => Ok(Format::Text),
            "json" => Ok(Format::Json),
            other => Err(CliError::UnknownFormat(other.to_string())),
        }
    }
}

/// Opens the device state at `path` on the system clock.
///
/// Refuses to create a fresh state directory.
pub fn open_store(path: &Path) -> CliResult<LocalStore> {
    if !path.is_dir() {
        return Err(CliError::NoState(path.to_path_buf()));
    }
    let backend = FileStateStore::open(path)?;
    if !backend.state_path().exists() {
        return Err(CliError::NoState(path.to_path_buf()));
    }
    Ok(LocalStore::open(Box::new(backend), Arc::new(SystemClock))?)
}
