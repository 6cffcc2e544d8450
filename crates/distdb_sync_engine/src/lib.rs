//! # DistDB Sync Engine
//!
//! Single-version data sync between two devices.
//!
//! This crate provides:
//! - [`DataSync`], which builds, sends and applies data packets
//! - [`SyncEngine`], the per-peer state machine driving push, pull and
//!   push-pull tasks and answering the peer's pulls
//! - [`Communicator`], [`Metadata`], [`AccessControl`] and [`Clock`], the
//!   seams to the device bus, the watermark store, the access policy and time
//! - [`LoopbackNetwork`], an in-process link for wiring engines together
//!
//! ## Watermarks
//!
//! Each side keeps two watermarks per peer. The local watermark is one past
//! the highest local timestamp the peer has been sent; the peer watermark is
//! one past the highest peer timestamp received. Every packet carries both,
//! so a side that lost its state (a rebuilt device) is detected on the next
//! exchange and the watermarks are rewound instead of silently skipping data.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use distdb_codec::SOFTWARE_VERSION_CURRENT;
//! use distdb_storage::MemorySyncStore;
//! use distdb_sync_engine::{LoopbackNetwork, SyncEngine};
//! use distdb_sync_protocol::SyncMode;
//!
//! let network = LoopbackNetwork::new();
//! let store_a = Arc::new(MemorySyncStore::default());
//! let store_b = Arc::new(MemorySyncStore::default());
//! store_a.put(b"k".to_vec(), b"v".to_vec()).unwrap();
//!
//! let a = SyncEngine::builder("device-b", store_a, network.endpoint("device-a"))
//!     .with_remote_version(SOFTWARE_VERSION_CURRENT)
//!     .build();
//! let b = SyncEngine::builder("device-a", store_b.clone(), network.endpoint("device-b"))
//!     .with_remote_version(SOFTWARE_VERSION_CURRENT)
//!     .build();
//!
//! a.start(SyncMode::Push).unwrap();
//! network
//!     .run_until_idle(|target, _| match target {
//!         "device-a" => Some(&a),
//!         "device-b" => Some(&b),
//!         _ => None,
//!     })
//!     .unwrap();
//! assert_eq!(store_b.get(b"k").unwrap(), Some(b"v".to_vec()));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod access;
mod clock;
mod communicator;
mod config;
mod context;
mod data_sync;
mod error;
mod metadata;
mod network;
mod state;

pub use access::{AccessControl, AllowAll, PermissionFlags, StaticAccessControl};
pub use clock::{apply_offset, Clock, ManualClock, SystemClock};
pub use communicator::{Communicator, MockCommunicator};
pub use config::{
    SyncConfig, AUTO_SYNC_TIMEOUT, MAX_HPMODE_PACK_ITEM_SIZE, MAX_NORMAL_PACK_ITEM_SIZE,
};
pub use context::{FeedDirection, ReSendInfo, ResponseTarget, SyncTaskContext};
pub use data_sync::{AckStep, DataSync, DataSyncParts, RecvStep};
pub use error::{SyncError, SyncResult};
pub use metadata::{MemoryMetadata, Metadata};
pub use network::{Envelope, LoopbackCommunicator, LoopbackNetwork};
pub use state::{SyncEngine, SyncEngineBuilder, SyncOutcome, SyncState, SyncStats, SyncStatus};
