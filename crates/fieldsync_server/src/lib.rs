//! # fieldsync server
//!
//! Authoritative side of fieldsync synchronization.
//!
//! This crate provides:
//! - Record store with per-record compare-and-set
//! - Pull and push request handling
//! - Payload validation hook
//! - CBOR endpoint routing for embedding behind an HTTP front end
//!
//! # Protocol
//!
//! A device pulls every record committed after its last watermark, then
//! pushes its pending entries. Each pushed entry carries the version it was
//! based on; the server writes it only if that is still the current version
//! and answers one disposition per entry: `accepted`, `rejected-conflict`
//! (with the current server record) or `rejected-validation`.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod config;
mod error;
mod handler;
mod server;
mod store;
mod validation;

pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use handler::{DeviceActivity, HandlerContext, RequestHandler};
pub use server::{SyncServer, PULL_ENDPOINT, PUSH_ENDPOINT};
pub use store::{AuthoritativeStore, CommittedRecord, PullBatch};
pub use validation::{DefaultValidator, PayloadValidator};
