//! # fieldsync protocol
//!
//! Record, change log and wire types shared by the device engine and the
//! authoritative server.
//!
//! This crate provides:
//! - `SyncRecord` and the identifier newtypes
//! - `ChangeLogEntry` for local mutations awaiting transmission
//! - `Conflict` records produced by conflict resolution
//! - Pull/push messages and their CBOR encoding
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod conflict;
mod entry;
mod error;
mod ids;
mod messages;
mod record;

pub use codec::{from_cbor, to_cbor, WireMessage};
pub use conflict::{Conflict, ConflictKind, ConflictState, Resolution};
pub use entry::{ChangeLogEntry, EntryState, Operation};
pub use error::{ProtocolError, ProtocolResult};
pub use ids::{ConflictId, DeviceId, EntryId, RecordId, SessionId};
pub use messages::{
    Disposition, PullRequest, PullResponse, PushEntry, PushOutcome, PushRequest, PushResponse,
};
pub use record::{SyncRecord, SyncStatus};
