//! Per-peer watermark store.

use std::collections::HashMap;

use distdb_storage::short_device_id;
use parking_lot::RwLock;
use tracing::debug;

use crate::error::SyncResult;

/// Watermarks and clock offset tracked for each peer device.
///
/// All watermark mutations of an exchange go through this store, so the send
/// path and the receive path never race on ad hoc copies.
pub trait Metadata: Send + Sync {
    /// Highest local timestamp already sent to `device`, plus one.
    fn get_local_water_mark(&self, device: &str) -> u64;

    /// Stores the local watermark toward `device`.
    fn save_local_water_mark(&self, device: &str, mark: u64) -> SyncResult<()>;

    /// Highest timestamp of `device` already received, plus one.
    fn get_peer_water_mark(&self, device: &str) -> u64;

    /// Stores the peer watermark of `device`.
    fn save_peer_water_mark(&self, device: &str, mark: u64) -> SyncResult<()>;

    /// Clock offset of `device` relative to the local clock.
    fn get_time_offset(&self, device: &str) -> i64;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct PeerMarks {
    local: u64,
    peer: u64,
    time_offset: i64,
}

/// Metadata held in memory.
#[derive(Debug, Default)]
pub struct MemoryMetadata {
    peers: RwLock<HashMap<String, PeerMarks>>,
}

impl MemoryMetadata {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the clock offset of `device`.
    pub fn set_time_offset(&self, device: &str, offset: i64) {
        self.peers
            .write()
            .entry(device.to_string())
            .or_default()
            .time_offset = offset;
    }

    /// Number of devices with recorded state.
    pub fn device_count(&self) -> usize {
        self.peers.read().len()
    }

    fn read(&self, device: &str) -> PeerMarks {
        self.peers.read().get(device).copied().unwrap_or_default()
    }
}

impl Metadata for MemoryMetadata {
    fn get_local_water_mark(&self, device: &str) -> u64 {
        self.read(device).local
    }

    fn save_local_water_mark(&self, device: &str, mark: u64) -> SyncResult<()> {
        debug!(device = %short_device_id(device), mark, "local watermark saved");
        self.peers.write().entry(device.to_string()).or_default().local = mark;
        Ok(())
    }

    fn get_peer_water_mark(&self, device: &str) -> u64 {
        self.read(device).peer
    }

    fn save_peer_water_mark(&self, device: &str, mark: u64) -> SyncResult<()> {
        debug!(device = %short_device_id(device), mark, "peer watermark saved");
        self.peers.write().entry(device.to_string()).or_default().peer = mark;
        Ok(())
    }

    fn get_time_offset(&self, device: &str) -> i64 {
        self.read(device).time_offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_device_reads_zero() {
        let metadata = MemoryMetadata::new();
        assert_eq!(metadata.get_local_water_mark("x"), 0);
        assert_eq!(metadata.get_peer_water_mark("x"), 0);
        assert_eq!(metadata.get_time_offset("x"), 0);
        assert_eq!(metadata.device_count(), 0);
    }

    #[test]
    fn marks_are_per_device() {
        let metadata = MemoryMetadata::new();
        metadata.save_local_water_mark("a", 10).unwrap();
        metadata.save_peer_water_mark("a", 20).unwrap();
        metadata.set_time_offset("b", -5);

        assert_eq!(metadata.get_local_water_mark("a"), 10);
        assert_eq!(metadata.get_peer_water_mark("a"), 20);
        assert_eq!(metadata.get_local_water_mark("b"), 0);
        assert_eq!(metadata.get_time_offset("b"), -5);
        assert_eq!(metadata.device_count(), 2);
    }
}
