//! The storage contract the sync layer drives.

use distdb_codec::{bytes_len, DataItem, U32_LEN, U64_LEN};

use crate::config::StoreProperties;
use crate::error::StorageResult;
use crate::security::SecurityOption;
use crate::token::ContinueToken;

/// Limits for one page of sync data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataSizeSpec {
    /// Byte budget of the page, by [`estimated_item_size`].
    pub block_size: usize,
    /// Maximum number of records in the page.
    pub packet_size: usize,
}

impl DataSizeSpec {
    /// Creates a page spec.
    pub fn new(block_size: usize, packet_size: usize) -> Self {
        Self {
            block_size,
            packet_size,
        }
    }
}

/// One page of a range scan.
#[derive(Debug, Default)]
pub struct SyncBatch {
    /// Records ascending by timestamp.
    pub items: Vec<DataItem>,
    /// Cursor for the rest of the range; `None` once the scan is finished.
    pub token: Option<ContinueToken>,
}

impl SyncBatch {
    /// Returns true if no more pages remain.
    pub fn is_finished(&self) -> bool {
        self.token.is_none()
    }
}

/// Notifications emitted by a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// A received batch was committed.
    SyncDataSaved {
        /// Device the batch came from.
        device: String,
        /// Records written.
        applied: usize,
    },
    /// Records received from a device were erased.
    DeviceDataRemoved {
        /// Device whose data was erased.
        device: String,
        /// Records erased.
        removed: usize,
    },
    /// A peer finished pushing to this store.
    RemotePushFinished {
        /// The pushing device.
        device: String,
    },
}

/// Bytes to reserve for fields appended after the first protocol version.
pub const APPEND_LEN: usize = U64_LEN;

const MIN_ORIG_DEVICE_LEN: usize = 40;

/// Size estimate of one record used to fill pages.
pub fn estimated_item_size(item: &DataItem, append_len: usize) -> usize {
    U64_LEN * 3
        + U32_LEN
        + bytes_len(item.key.len())
        + bytes_len(item.value.len())
        + item.orig_device.len().max(MIN_ORIG_DEVICE_LEN)
        + append_len
}

/// Everything the synchronizer needs from the local engine.
///
/// Implementations must be `Send + Sync`; the synchronizer calls them from
/// whichever task handles the current message.
pub trait SyncStorage: Send + Sync {
    /// Reads records with `begin <= timestamp < end`, ascending.
    ///
    /// # Errors
    ///
    /// `begin >= end` or an oversized block is `InvalidArgs`. Cache mode
    /// reports `KeyRevoked`, migration reports `Busy`.
    fn get_sync_data(&self, begin: u64, end: u64, spec: DataSizeSpec) -> StorageResult<SyncBatch>;

    /// Continues a scan from `token.begin()`.
    ///
    /// # Errors
    ///
    /// A token not issued by this store is `InvalidToken`.
    fn get_sync_data_next(
        &self,
        token: ContinueToken,
        spec: DataSizeSpec,
    ) -> StorageResult<SyncBatch>;

    /// Releases an unfinished scan.
    fn release_continue_token(&self, token: ContinueToken) {
        drop(token);
    }

    /// Applies received records atomically.
    fn put_sync_data(&self, items: Vec<DataItem>, device: &str) -> StorageResult<()>;

    /// Erases all records received from `device`.
    fn remove_device_data(&self, device: &str, notify: bool) -> StorageResult<()>;

    /// Current maximum timestamp.
    fn get_max_timestamp(&self) -> u64;

    /// Raises the maximum timestamp to at least `timestamp`.
    fn set_max_timestamp(&self, timestamp: u64);

    /// Local security option.
    ///
    /// # Errors
    ///
    /// `NotSupport` when the store has no label.
    fn get_security_option(&self) -> StorageResult<SecurityOption>;

    /// Returns false while reads are restricted.
    fn is_readable(&self) -> bool;

    /// Store identity.
    fn properties(&self) -> StoreProperties;

    /// Signals that `device` finished pushing to this store.
    fn notify_remote_push_finished(&self, device: &str);
}
