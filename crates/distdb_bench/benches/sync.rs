//! End-to-end sync benchmarks over the loopback network.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use distdb_bench::seeded_store;
use distdb_codec::SOFTWARE_VERSION_CURRENT;
use distdb_storage::MemorySyncStore;
use distdb_sync_engine::{LoopbackNetwork, ManualClock, SyncConfig, SyncEngine};
use distdb_sync_protocol::SyncMode;

struct Pair {
    network: Arc<LoopbackNetwork>,
    a: SyncEngine,
    b: SyncEngine,
}

fn pair(count: usize, config: &SyncConfig) -> Pair {
    let network = LoopbackNetwork::new();
    let clock = Arc::new(ManualClock::new(count as u64 + 10));
    let store_a = Arc::new(seeded_store(count, 64));
    let store_b = Arc::new(MemorySyncStore::default());
    let a = SyncEngine::builder("device-b", store_a, network.endpoint("device-a"))
        .with_config(config.clone())
        .with_clock(clock.clone())
        .with_remote_version(SOFTWARE_VERSION_CURRENT)
        .build();
    let b = SyncEngine::builder("device-a", store_b, network.endpoint("device-b"))
        .with_config(config.clone())
        .with_clock(clock)
        .with_remote_version(SOFTWARE_VERSION_CURRENT)
        .build();
    Pair { network, a, b }
}

fn run(pair: &Pair, initiator: &SyncEngine, mode: SyncMode) -> usize {
    initiator.start(mode).unwrap();
    pair.network
        .run_until_idle(|target, _| match target {
            "device-a" => Some(&pair.a),
            "device-b" => Some(&pair.b),
            _ => None,
        })
        .unwrap()
}

/// Benchmark a full push at several packet item caps.
fn bench_push(c: &mut Criterion) {
    let mut group = c.benchmark_group("push");
    let count = 2_000;
    group.throughput(Throughput::Elements(count as u64));
    group.sample_size(20);

    for pack in [100, 500, 2000].iter() {
        let config = SyncConfig::new().with_pack_item_sizes(*pack, *pack);
        group.bench_with_input(BenchmarkId::from_parameter(pack), &config, |b, config| {
            b.iter_batched(
                || pair(count, config),
                |pair| black_box(run(&pair, &pair.a, SyncMode::Push)),
                criterion::BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

/// Benchmark a pull answered by the peer.
fn bench_pull(c: &mut Criterion) {
    let mut group = c.benchmark_group("pull");
    let count = 2_000;
    group.throughput(Throughput::Elements(count as u64));
    group.sample_size(20);
    let config = SyncConfig::new();

    group.bench_function("2000", |b| {
        b.iter_batched(
            || pair(count, &config),
            // device A holds the records, so device B pulls them
            |pair| black_box(run(&pair, &pair.b, SyncMode::Pull)),
            criterion::BatchSize::LargeInput,
        );
    });

    group.finish();
}

criterion_group!(benches, bench_push, bench_pull);
criterion_main!(benches);
