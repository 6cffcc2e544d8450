//! Benchmark utilities.

use distdb_codec::DataItem;
use distdb_storage::MemorySyncStore;
use rand::Rng;

/// Generate random bytes of the specified size.
pub fn random_data(size: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..size).map(|_| rng.gen()).collect()
}

/// Generate `count` records with random values of `value_size` bytes,
/// stamped `1..=count`.
pub fn generate_items(count: usize, value_size: usize) -> Vec<DataItem> {
    (1..=count)
        .map(|i| {
            DataItem::new(
                format!("key-{i:08}").into_bytes(),
                random_data(value_size),
                i as u64,
            )
        })
        .collect()
}

/// A store seeded with [`generate_items`].
pub fn seeded_store(count: usize, value_size: usize) -> MemorySyncStore {
    let store = MemorySyncStore::default();
    for item in generate_items(count, value_size) {
        store
            .put_at(item.key, item.value, item.timestamp)
            .expect("Failed to seed store");
    }
    store
}
