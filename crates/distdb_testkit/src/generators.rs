//! Property-based test generators using proptest.
//!
//! Provides strategies for generating records and protocol values that
//! respect the limits the codec and the store enforce.

use std::collections::BTreeMap;

use distdb_codec::{
    DataItem, DELETE_FLAG, SOFTWARE_VERSION_CURRENT, SOFTWARE_VERSION_EARLIEST,
};
use distdb_storage::hash_device_id;
use distdb_sync_protocol::{SyncCode, SyncMode};
use proptest::prelude::*;

/// Strategy for record keys.
pub fn key_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 1..64)
}

/// Strategy for record values.
pub fn value_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..256)
}

/// Strategy for origin device fields: empty or a hashed device name.
pub fn orig_device_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        Just(String::new()),
        "[a-z]{1,12}".prop_map(|name| hash_device_id(&name)),
    ]
}

/// Strategy for single records, live or deleted.
pub fn data_item_strategy() -> impl Strategy<Value = DataItem> {
    (
        key_strategy(),
        value_strategy(),
        1u64..1_000_000,
        0u64..1_000_000,
        any::<bool>(),
        orig_device_strategy(),
    )
        .prop_map(|(key, value, timestamp, write_timestamp, deleted, orig)| {
            let item = if deleted {
                DataItem {
                    flag: DELETE_FLAG,
                    ..DataItem::new(key, Vec::new(), timestamp)
                }
            } else {
                DataItem::new(key, value, timestamp)
            };
            item.with_write_timestamp(write_timestamp)
                .with_orig_device(orig)
        })
}

/// Strategy for batches with distinct keys and distinct timestamps.
pub fn unique_items_strategy(max_len: usize) -> impl Strategy<Value = Vec<DataItem>> {
    prop::collection::btree_map(key_strategy(), value_strategy(), 0..=max_len).prop_map(
        |entries: BTreeMap<Vec<u8>, Vec<u8>>| {
            entries
                .into_iter()
                .enumerate()
                .map(|(i, (key, value))| DataItem::new(key, value, i as u64 + 1))
                .collect()
        },
    )
}

/// Strategy for protocol versions this build can speak.
pub fn version_strategy() -> impl Strategy<Value = u32> {
    SOFTWARE_VERSION_EARLIEST..=SOFTWARE_VERSION_CURRENT
}

/// Strategy for sync modes a task can start with.
pub fn task_mode_strategy() -> impl Strategy<Value = SyncMode> {
    prop_oneof![
        Just(SyncMode::Push),
        Just(SyncMode::Pull),
        Just(SyncMode::PushAndPull),
    ]
}

/// Strategy for result codes, including unknown ones.
pub fn sync_code_strategy() -> impl Strategy<Value = SyncCode> {
    prop_oneof![
        Just(SyncCode::Ok),
        Just(SyncCode::SendFinished),
        Just(SyncCode::WaterMarkInvalid),
        Just(SyncCode::LocalWaterMarkNotInit),
        Just(SyncCode::Busy),
        Just(SyncCode::NotPermit),
        any::<i32>().prop_map(SyncCode::from_code),
    ]
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}
