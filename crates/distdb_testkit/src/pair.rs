//! Two devices joined by a loopback network.
//!
//! Device A runs engine `a`, which syncs with device B; device B runs engine
//! `b`, which syncs with device A. Both share one manual clock set far past
//! any timestamp the fixtures write, so end marks cover every record.

use std::sync::Arc;

use distdb_codec::SOFTWARE_VERSION_CURRENT;
use distdb_storage::MemorySyncStore;
use distdb_sync_engine::{
    AccessControl, AllowAll, LoopbackNetwork, ManualClock, MemoryMetadata, SyncConfig,
    SyncEngine,
};

/// Identity of the first device.
pub const DEVICE_A: &str = "device-a";
/// Identity of the second device.
pub const DEVICE_B: &str = "device-b";
/// Clock reading shared by both devices.
pub const PAIR_CLOCK_START: u64 = 1_000_000;

/// Settings of one side of a [`DevicePair`].
#[derive(Clone)]
pub struct DeviceOptions {
    /// Engine configuration.
    pub config: SyncConfig,
    /// Access policy.
    pub access: Arc<dyn AccessControl>,
    /// Software version this device believes its peer runs; 0 means unknown.
    pub remote_version: u32,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            config: SyncConfig::default(),
            access: Arc::new(AllowAll),
            remote_version: SOFTWARE_VERSION_CURRENT,
        }
    }
}

/// Builder for [`DevicePair`].
#[derive(Clone, Default)]
pub struct DevicePairBuilder {
    a: DeviceOptions,
    b: DeviceOptions,
}

impl DevicePairBuilder {
    /// Uses `config` on both devices.
    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.a.config = config.clone();
        self.b.config = config;
        self
    }

    /// Overrides the options of device A.
    pub fn with_a(mut self, options: DeviceOptions) -> Self {
        self.a = options;
        self
    }

    /// Overrides the options of device B.
    pub fn with_b(mut self, options: DeviceOptions) -> Self {
        self.b = options;
        self
    }

    /// Builds both devices with empty stores.
    pub fn build(self) -> DevicePair {
        let network = LoopbackNetwork::new();
        let clock = Arc::new(ManualClock::new(PAIR_CLOCK_START));
        let side_a = Side::new(&network, &clock, DEVICE_A, DEVICE_B, &self.a);
        let side_b = Side::new(&network, &clock, DEVICE_B, DEVICE_A, &self.b);
        DevicePair {
            network,
            clock,
            store_a: side_a.store,
            store_b: side_b.store,
            metadata_a: side_a.metadata,
            metadata_b: side_b.metadata,
            a: side_a.engine,
            b: side_b.engine,
            options_b: self.b,
        }
    }
}

struct Side {
    store: Arc<MemorySyncStore>,
    metadata: Arc<MemoryMetadata>,
    engine: SyncEngine,
}

impl Side {
    fn new(
        network: &Arc<LoopbackNetwork>,
        clock: &Arc<ManualClock>,
        identity: &str,
        peer: &str,
        options: &DeviceOptions,
    ) -> Self {
        let store = Arc::new(MemorySyncStore::default());
        let metadata = Arc::new(MemoryMetadata::new());
        let engine = SyncEngine::builder(peer, store.clone(), network.endpoint(identity))
            .with_config(options.config.clone())
            .with_metadata(metadata.clone())
            .with_access_control(options.access.clone())
            .with_clock(clock.clone())
            .with_remote_version(options.remote_version)
            .build();
        Self {
            store,
            metadata,
            engine,
        }
    }
}

/// Two sync engines on a shared loopback network.
pub struct DevicePair {
    /// The link between the devices.
    pub network: Arc<LoopbackNetwork>,
    /// Clock shared by both devices.
    pub clock: Arc<ManualClock>,
    /// Store of device A.
    pub store_a: Arc<MemorySyncStore>,
    /// Store of device B.
    pub store_b: Arc<MemorySyncStore>,
    /// Watermarks device A keeps for device B.
    pub metadata_a: Arc<MemoryMetadata>,
    /// Watermarks device B keeps for device A.
    pub metadata_b: Arc<MemoryMetadata>,
    /// Engine on device A.
    pub a: SyncEngine,
    /// Engine on device B.
    pub b: SyncEngine,
    options_b: DeviceOptions,
}

/// Two devices with default settings.
pub fn paired_devices() -> DevicePair {
    DevicePairBuilder::default().build()
}

impl DevicePair {
    /// Starts building a pair.
    pub fn builder() -> DevicePairBuilder {
        DevicePairBuilder::default()
    }

    /// Delivers messages until both devices are quiet and returns the count.
    pub fn run(&self) -> usize {
        self.network
            .run_until_idle(|target, _| match target {
                DEVICE_A => Some(&self.a),
                DEVICE_B => Some(&self.b),
                _ => None,
            })
            .expect("Exchange did not settle")
    }

    /// Replaces device B with a freshly installed one: empty store, no
    /// watermarks, same identity and options.
    pub fn rebuild_b(&mut self) {
        let side = Side::new(&self.network, &self.clock, DEVICE_B, DEVICE_A, &self.options_b);
        self.store_b = side.store;
        self.metadata_b = side.metadata;
        self.b = side.engine;
    }
}
