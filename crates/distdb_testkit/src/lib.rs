//! # DistDB Testkit
//!
//! Test utilities for DistDB sync.
//!
//! This crate provides:
//! - Property-based test generators using proptest
//! - Store fixtures and wire packet files
//! - [`DevicePair`], two sync engines joined by a loopback network
//! - Fuzz harnesses for the wire decoders
//!
//! ## Usage
//!
//! ```rust
//! use distdb_testkit::prelude::*;
//! use distdb_sync_protocol::SyncMode;
//!
//! let pair = paired_devices();
//! pair.store_a.put_at(b"k".to_vec(), b"v".to_vec(), 10).unwrap();
//! pair.a.start(SyncMode::Push).unwrap();
//! pair.run();
//! assert_eq!(pair.store_b.get(b"k").unwrap(), Some(b"v".to_vec()));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod fuzz;
pub mod generators;
pub mod pair;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::fuzz::*;
    pub use crate::generators::*;
    pub use crate::pair::*;
}

pub use fixtures::*;
pub use fuzz::*;
pub use generators::*;
pub use pair::*;
