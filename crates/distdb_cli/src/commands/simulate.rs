//! Simulate command implementation.
//!
//! Two devices, `device-a` and `device-b`, each get an in-memory store and a
//! sync engine joined by a loopback link. Device A starts one task and the
//! link is drained until both devices are quiet.

use clap::ValueEnum;
use distdb_storage::MemorySyncStore;
use distdb_sync_engine::{
    LoopbackNetwork, ManualClock, MemoryMetadata, Metadata, SyncConfig, SyncEngine,
};
use distdb_sync_protocol::SyncMode;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use crate::OutputFormat;

const DEVICE_A: &str = "device-a";
const DEVICE_B: &str = "device-b";

/// Exchange the simulation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SimulationMode {
    /// A sends its records to B.
    Push,
    /// A fetches B's records.
    Pull,
    /// Both directions in one task.
    PushPull,
}

impl From<SimulationMode> for SyncMode {
    fn from(mode: SimulationMode) -> Self {
        match mode {
            SimulationMode::Push => SyncMode::Push,
            SimulationMode::Pull => SyncMode::Pull,
            SimulationMode::PushPull => SyncMode::PushAndPull,
        }
    }
}

/// Watermarks and record count of one device after the run.
#[derive(Debug, Serialize)]
pub struct DeviceReport {
    /// Device identity.
    pub device: String,
    /// Live records in its store.
    pub records: usize,
    /// Next timestamp it will send to the other device.
    pub local_water_mark: u64,
    /// Next timestamp it expects from the other device.
    pub peer_water_mark: u64,
}

/// Result of a simulation.
#[derive(Debug, Serialize)]
pub struct SimulationReport {
    /// Exchange that ran.
    pub mode: String,
    /// Final status reported by device A.
    pub outcome: String,
    /// Messages delivered over the link.
    pub messages: usize,
    /// Wall time of the exchange.
    pub elapsed_ms: u128,
    /// Device A.
    pub device_a: DeviceReport,
    /// Device B.
    pub device_b: DeviceReport,
}

struct Device {
    store: Arc<MemorySyncStore>,
    metadata: Arc<MemoryMetadata>,
    engine: SyncEngine,
}

impl Device {
    fn new(
        network: &Arc<LoopbackNetwork>,
        clock: &Arc<ManualClock>,
        identity: &str,
        peer: &str,
        config: &SyncConfig,
    ) -> Self {
        let store = Arc::new(MemorySyncStore::default());
        let metadata = Arc::new(MemoryMetadata::new());
        let engine = SyncEngine::builder(peer, store.clone(), network.endpoint(identity))
            .with_config(config.clone())
            .with_metadata(metadata.clone())
            .with_clock(clock.clone())
            .with_remote_version(distdb_codec::SOFTWARE_VERSION_CURRENT)
            .build();
        Self {
            store,
            metadata,
            engine,
        }
    }

    fn seed(
        &self,
        prefix: &str,
        count: usize,
        first_timestamp: u64,
    ) -> Result<(), Box<dyn std::error::Error>> {
        for i in 0..count {
            self.store.put_at(
                format!("{prefix}-{i:06}"),
                format!("value-{i}"),
                first_timestamp + i as u64,
            )?;
        }
        Ok(())
    }

    fn report(&self, identity: &str, peer: &str) -> DeviceReport {
        DeviceReport {
            device: identity.to_string(),
            records: self.store.len(),
            local_water_mark: self.metadata.get_local_water_mark(peer),
            peer_water_mark: self.metadata.get_peer_water_mark(peer),
        }
    }
}

/// Runs one exchange between two fresh devices.
pub fn simulate(
    records: usize,
    mode: SimulationMode,
    pack_size: Option<usize>,
) -> Result<SimulationReport, Box<dyn std::error::Error>> {
    let mut config = SyncConfig::default();
    if let Some(size) = pack_size {
        if size == 0 {
            return Err("pack size must be positive".into());
        }
        config = config.with_pack_item_sizes(size, size);
    }
    let network = LoopbackNetwork::new();
    let first_timestamp = 1;
    let clock = Arc::new(ManualClock::new(first_timestamp + 2 * records as u64 + 1));
    let a = Device::new(&network, &clock, DEVICE_A, DEVICE_B, &config);
    let b = Device::new(&network, &clock, DEVICE_B, DEVICE_A, &config);

    match mode {
        SimulationMode::Push => a.seed("a", records, first_timestamp)?,
        SimulationMode::Pull => b.seed("b", records, first_timestamp)?,
        SimulationMode::PushPull => {
            a.seed("a", records, first_timestamp)?;
            b.seed("b", records, first_timestamp + records as u64)?;
        }
    }

    let mut outcomes = a.engine.subscribe();
    let sync_mode = SyncMode::from(mode);
    info!(%sync_mode, records, "simulation started");
    let started = Instant::now();
    a.engine.start(sync_mode)?;
    let messages = network.run_until_idle(|target, _| match target {
        DEVICE_A => Some(&a.engine),
        DEVICE_B => Some(&b.engine),
        _ => None,
    })?;
    let elapsed_ms = started.elapsed().as_millis();

    let outcome = match outcomes.try_recv() {
        Ok(outcome) => format!("{:?}", outcome.status),
        Err(_) => format!("unfinished ({:?})", a.engine.state()),
    };
    info!(%outcome, messages, elapsed_ms, "simulation finished");

    Ok(SimulationReport {
        mode: sync_mode.to_string(),
        outcome,
        messages,
        elapsed_ms,
        device_a: a.report(DEVICE_A, DEVICE_B),
        device_b: b.report(DEVICE_B, DEVICE_A),
    })
}

/// Runs the simulate command.
pub fn run(
    records: usize,
    mode: SimulationMode,
    pack_size: Option<usize>,
    format: OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let report = simulate(records, mode, pack_size)?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => print_text_output(&report),
    }
    Ok(())
}

fn print_text_output(report: &SimulationReport) {
    println!("DistDB Sync Simulation");
    println!("======================");
    println!();
    println!("Mode:     {}", report.mode);
    println!("Outcome:  {}", report.outcome);
    println!("Messages: {}", report.messages);
    println!("Elapsed:  {} ms", report.elapsed_ms);
    for device in [&report.device_a, &report.device_b] {
        println!();
        println!("{}:", device.device);
        println!("  Records:          {}", device.records);
        println!("  Local watermark:  {}", device.local_water_mark);
        println!("  Peer watermark:   {}", device.peer_water_mark);
    }
}
