//! Store fixtures and wire packet files.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use distdb_codec::{CodecResult, DataItem, SOFTWARE_VERSION_CURRENT};
use distdb_storage::{MemorySyncStore, StoreConfig};
use distdb_sync_protocol::{DataAckPacket, DataRequestPacket, SyncCode, SyncMode};
use tempfile::TempDir;

/// A store holding `count` local records `key-<i>` stamped `1..=count`.
pub fn store_with_items(count: usize) -> Arc<MemorySyncStore> {
    store_with_items_in(StoreConfig::default(), count)
}

/// Like [`store_with_items`] with an explicit store configuration.
pub fn store_with_items_in(config: StoreConfig, count: usize) -> Arc<MemorySyncStore> {
    let store = MemorySyncStore::new(config);
    for i in 1..=count {
        store
            .put_at(format!("key-{i}"), format!("value-{i}"), i as u64)
            .expect("Failed to seed store");
    }
    Arc::new(store)
}

/// `count` records `key-<i>` stamped from `first_timestamp` upward.
pub fn sample_items(count: usize, first_timestamp: u64) -> Vec<DataItem> {
    (0..count)
        .map(|i| {
            DataItem::new(
                format!("key-{i}").into_bytes(),
                format!("value-{i}").into_bytes(),
                first_timestamp + i as u64,
            )
        })
        .collect()
}

/// A last-page push request carrying `items`.
pub fn sample_request(items: Vec<DataItem>) -> DataRequestPacket {
    let mut packet = DataRequestPacket::new(SOFTWARE_VERSION_CURRENT);
    let local_mark = items.first().map_or(0, |item| item.timestamp);
    packet.data = items;
    packet.set_basic_info(
        SyncCode::Ok,
        SOFTWARE_VERSION_CURRENT,
        local_mark,
        0,
        SyncMode::Push,
    );
    packet.set_last_sequence();
    packet.set_packet_id(1);
    packet
}

/// Encoded packets written to a temporary directory.
///
/// The directory is removed when the value is dropped.
pub struct PacketFiles {
    dir: TempDir,
}

impl PacketFiles {
    /// Creates an empty directory.
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("Failed to create temp directory"),
        }
    }

    /// Directory holding the files.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Writes raw bytes to `name`.
    pub fn write_raw(&self, name: &str, bytes: &[u8]) -> PathBuf {
        let path = self.dir.path().join(name);
        fs::write(&path, bytes).expect("Failed to write packet file");
        path
    }

    /// Writes an encoded request packet to `name`.
    pub fn write_request(&self, name: &str, packet: &DataRequestPacket) -> CodecResult<PathBuf> {
        Ok(self.write_raw(name, &packet.serialize()?))
    }

    /// Writes an encoded ack packet to `name`.
    pub fn write_ack(&self, name: &str, packet: &DataAckPacket) -> CodecResult<PathBuf> {
        Ok(self.write_raw(name, &packet.serialize()?))
    }
}

impl Default for PacketFiles {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use distdb_storage::SyncStorage;

    #[test]
    fn seeded_store_has_items() {
        let store = store_with_items(3);
        assert_eq!(store.len(), 3);
        assert_eq!(store.get_max_timestamp(), 3);
        assert_eq!(store.get(b"key-2").unwrap(), Some(b"value-2".to_vec()));
    }

    #[test]
    fn packet_files_round_trip() {
        let files = PacketFiles::new();
        let packet = sample_request(sample_items(2, 10));
        let path = files.write_request("push.bin", &packet).unwrap();
        let bytes = fs::read(&path).unwrap();
        assert_eq!(DataRequestPacket::deserialize(&bytes).unwrap(), packet);
        assert!(path.starts_with(files.path()));
    }
}
