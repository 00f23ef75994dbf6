//! # fieldsync engine
//!
//! Device-side synchronization for offline-first field applications.
//!
//! This crate provides:
//! - Local store with an append-only change log
//! - Priority scheduling of pending mutations
//! - Deterministic conflict resolution with an audit trail
//! - Eviction of synced data under storage pressure
//! - Sync coordinator state machine (idle → pulling → pushing →
//!   reconciling → committing)
//! - Transport abstraction with retry, backoff and cancellation
//!
//! ## Architecture
//!
//! Every local mutation is recorded in the change log and applied to the
//! local store in one transaction. A sync session pulls server changes
//! first, then pushes pending entries in priority order, resolves rejected
//! conflicts and commits the outcome atomically.
//!
//! ## Key Invariants
//!
//! - An entry is removed only after the server confirmed it `accepted`
//! - Entries of one record reach the server in version order
//! - Unsynced records are never evicted
//! - At most one session runs at a time per device
//! - Identical inputs always resolve to the same conflict winner

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change_log;
mod clock;
mod config;
mod coordinator;
mod error;
mod eviction;
mod http;
mod persist;
mod resolver;
mod retry;
mod scheduler;
mod session;
mod state;
mod store;
mod transport;

pub use change_log::ChangeLog;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{EvictionConfig, Footprint, RetryConfig, SyncConfig};
pub use coordinator::SyncCoordinator;
pub use error::{SyncError, SyncResult};
pub use eviction::{EvictionManager, EvictionReport, StoragePressure};
pub use http::{
    HttpClient, HttpError, HttpTransport, LoopbackClient, LoopbackServer, PULL_PATH, PUSH_PATH,
};
pub use persist::{FileStateStore, MemoryStateStore, StateStore, FORMAT_VERSION};
pub use resolver::{ConflictResolver, Resolved, Verdict};
pub use retry::with_retry;
pub use scheduler::PriorityScheduler;
pub use session::{
    SessionOutcome, SessionReport, SessionResult, SessionSummary, SyncTrigger,
    ValidationFailure, ViolationReport,
};
pub use state::{SyncState, SyncStats};
pub use store::{DeviceState, LocalRecord, LocalStore, RemoteApply, StoreTxn};
pub use transport::{MockTransport, SyncTransport};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
