//! Sync store benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use distdb_bench::{generate_items, seeded_store};
use distdb_storage::{DataSizeSpec, MemorySyncStore, SyncStorage, MAX_SYNC_BLOCK_SIZE};

/// Benchmark a full paginated scan at several page sizes.
fn bench_paginated_extraction(c: &mut Criterion) {
    let mut group = c.benchmark_group("paginated_extraction");
    let count = 10_000;
    let store = seeded_store(count, 64);
    group.throughput(Throughput::Elements(count as u64));

    for page in [100, 500, 2000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(page), page, |b, &page| {
            let spec = DataSizeSpec::new(MAX_SYNC_BLOCK_SIZE, page);
            b.iter(|| {
                let mut batch = store.get_sync_data(0, u64::MAX, spec).unwrap();
                let mut seen = batch.items.len();
                while let Some(token) = batch.token.take() {
                    batch = store.get_sync_data_next(token, spec).unwrap();
                    seen += batch.items.len();
                }
                black_box(seen);
            });
        });
    }

    group.finish();
}

/// Benchmark pages bounded by byte budget instead of item count.
fn bench_block_bounded_pages(c: &mut Criterion) {
    let mut group = c.benchmark_group("block_bounded_page");
    let store = seeded_store(2_000, 1024);

    for block in [4 * 1024, 64 * 1024, 1024 * 1024].iter() {
        group.throughput(Throughput::Bytes(*block as u64));
        group.bench_with_input(BenchmarkId::from_parameter(block), block, |b, &block| {
            let spec = DataSizeSpec::new(block, 2000);
            b.iter(|| {
                let batch = store.get_sync_data(0, u64::MAX, spec).unwrap();
                if let Some(token) = batch.token {
                    store.release_continue_token(token);
                }
                black_box(batch.items.len());
            });
        });
    }

    group.finish();
}

/// Benchmark applying received batches.
fn bench_put_sync_data(c: &mut Criterion) {
    let mut group = c.benchmark_group("put_sync_data");

    for count in [10, 100, 1000].iter() {
        let items = generate_items(*count, 128);
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &items, |b, items| {
            b.iter_batched(
                MemorySyncStore::default,
                |store| {
                    store.put_sync_data(items.clone(), "device-b").unwrap();
                    black_box(store.len());
                },
                criterion::BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

/// Benchmark removing a device's records.
fn bench_remove_device_data(c: &mut Criterion) {
    let items = generate_items(1000, 64);
    c.bench_function("remove_device_data_1000", |b| {
        b.iter_batched(
            || {
                let store = MemorySyncStore::default();
                store.put_sync_data(items.clone(), "device-b").unwrap();
                store
            },
            |store| {
                store.remove_device_data("device-b", false).unwrap();
                black_box(store.len());
            },
            criterion::BatchSize::SmallInput,
        );
    });
}

criterion_group!(
    benches,
    bench_paginated_extraction,
    bench_block_bounded_pages,
    bench_put_sync_data,
    bench_remove_device_data,
);
criterion_main!(benches);
