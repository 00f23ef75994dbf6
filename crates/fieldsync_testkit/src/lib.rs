//! # fieldsync testkit
//!
//! Test utilities for fieldsync.
//!
//! This crate provides:
//! - Fixtures: simulated devices wired to an in-process server
//! - An in-process server endpoint with fault injection
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use fieldsync_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn two_devices_converge() {
//!     let server = test_server();
//!     let a = TestDevice::new(&server, 1);
//!     let b = TestDevice::new(&server, 2);
//!     a.store.create("visit", b"hello".to_vec(), false).unwrap();
//!     a.sync().await;
//!     b.sync().await;
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod loopback;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::loopback::*;
}

pub use fixtures::*;
pub use generators::*;
pub use loopback::*;
