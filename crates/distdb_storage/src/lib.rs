//! # DistDB Storage
//!
//! The storage side of data sync: the [`SyncStorage`] contract the
//! synchronizer drives, and [`MemorySyncStore`], an in-memory store that
//! implements it.
//!
//! A store hands out records in timestamp order, one page at a time. An
//! unfinished scan returns a [`ContinueToken`]; dropping the token releases
//! the scan. Received batches are applied atomically under a last-write-wins
//! rule and remember which device delivered them, so a rebuilt peer's data
//! can be erased with [`SyncStorage::remove_device_data`].
//!
//! ## Example
//!
//! ```rust
//! use distdb_storage::{DataSizeSpec, MemorySyncStore, SyncStorage};
//!
//! let store = MemorySyncStore::default();
//! store.put_at(b"k1".to_vec(), b"v1".to_vec(), 100).unwrap();
//! store.put_at(b"k2".to_vec(), b"v2".to_vec(), 101).unwrap();
//!
//! let batch = store.get_sync_data(0, 200, DataSizeSpec::new(4096, 1)).unwrap();
//! assert_eq!(batch.items.len(), 1);
//! let rest = store.get_sync_data_next(batch.token.unwrap(), DataSizeSpec::new(4096, 1)).unwrap();
//! assert_eq!(rest.items[0].timestamp, 101);
//! assert!(rest.is_finished());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod conflict;
mod device;
mod error;
mod interface;
mod memory;
mod security;
mod token;

pub use config::{ConflictResolvePolicy, StoreConfig, StoreProperties, MAX_SYNC_BLOCK_SIZE};
pub use conflict::{resolve, ConflictResolution};
pub use device::{hash_device_id, short_device_id};
pub use error::{StorageError, StorageResult};
pub use interface::{
    estimated_item_size, DataSizeSpec, StoreEvent, SyncBatch, SyncStorage, APPEND_LEN,
};
pub use memory::{EngineState, MemorySyncStore, UNKNOWN_DEVICE};
pub use security::{SecurityFlag, SecurityLabel, SecurityOption};
pub use token::{ContinueToken, TokenRegistry};
