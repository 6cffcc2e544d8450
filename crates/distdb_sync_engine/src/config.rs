//! Configuration for the sync engine.

use std::time::Duration;

use distdb_codec::has_packet_id;

/// Item cap per packet for peers up to release 2.0.
pub const MAX_NORMAL_PACK_ITEM_SIZE: usize = 4000;
/// Item cap per packet for newer peers.
pub const MAX_HPMODE_PACK_ITEM_SIZE: usize = 2000;
/// Base timeout of one sync step.
pub const AUTO_SYNC_TIMEOUT: Duration = Duration::from_millis(5000);

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Erase a peer's records when it turns out to have been rebuilt.
    pub clear_remote_stale_data: bool,
    /// Base timeout of one sync step; also scales the watchdog feed time.
    pub auto_sync_timeout: Duration,
    /// Timeout handed to the communicator for each send.
    pub send_timeout: Duration,
    /// Item cap per packet for peers up to release 2.0.
    pub normal_pack_item_size: usize,
    /// Item cap per packet for newer peers.
    pub hp_mode_pack_item_size: usize,
    /// Share of the communicator MTU used as the packet byte budget.
    pub mtu_ratio: (u32, u32),
    /// Batches with at least this many records are preceded by a save notify.
    pub save_notify_threshold: usize,
}

impl SyncConfig {
    /// Creates a configuration with default settings.
    pub fn new() -> Self {
        Self {
            clear_remote_stale_data: false,
            auto_sync_timeout: AUTO_SYNC_TIMEOUT,
            send_timeout: Duration::from_secs(5),
            normal_pack_item_size: MAX_NORMAL_PACK_ITEM_SIZE,
            hp_mode_pack_item_size: MAX_HPMODE_PACK_ITEM_SIZE,
            mtu_ratio: (9, 10),
            save_notify_threshold: 1000,
        }
    }

    /// Sets whether stale data of a rebuilt peer is erased.
    pub fn with_clear_remote_stale_data(mut self, clear: bool) -> Self {
        self.clear_remote_stale_data = clear;
        self
    }

    /// Sets the step timeout.
    pub fn with_auto_sync_timeout(mut self, timeout: Duration) -> Self {
        self.auto_sync_timeout = timeout;
        self
    }

    /// Sets the send timeout.
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Sets both packet item caps.
    pub fn with_pack_item_sizes(mut self, normal: usize, hp_mode: usize) -> Self {
        self.normal_pack_item_size = normal;
        self.hp_mode_pack_item_size = hp_mode;
        self
    }

    /// Sets the save notify threshold.
    pub fn with_save_notify_threshold(mut self, threshold: usize) -> Self {
        self.save_notify_threshold = threshold;
        self
    }

    /// Item cap per packet for a negotiated `version`.
    pub fn pack_item_size(&self, version: u32) -> usize {
        if has_packet_id(version) {
            self.hp_mode_pack_item_size
        } else {
            self.normal_pack_item_size
        }
    }

    /// Packet byte budget for a communicator MTU.
    pub fn mtu_budget(&self, mtu: u32) -> u32 {
        let (numerator, denominator) = self.mtu_ratio;
        if denominator == 0 {
            return mtu;
        }
        (u64::from(mtu) * u64::from(numerator) / u64::from(denominator)) as u32
    }

    /// Watchdog feed time in milliseconds for a packet of `packet_len` bytes,
    /// or `None` when the packet fits the budget.
    pub fn feed_time(&self, packet_len: usize, mtu_budget: u32) -> Option<u32> {
        if mtu_budget == 0 || packet_len <= mtu_budget as usize {
            return None;
        }
        let millis = self.auto_sync_timeout.as_millis() as u64;
        let time = (packet_len as u64).saturating_mul(millis) / u64::from(mtu_budget);
        Some(time.min(u64::from(u32::MAX)) as u32)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}
