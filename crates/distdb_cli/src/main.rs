//! DistDB CLI
//!
//! Command-line tools for DistDB sync.
//!
//! # Commands
//!
//! - `inspect` - Decode a captured data request or ack packet
//! - `simulate` - Run two in-memory devices through one sync exchange
//! - `version` - Show version information

mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use commands::inspect::PacketKind;
use commands::simulate::SimulationMode;

/// Output format shared by the commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text.
    Text,
    /// Pretty-printed JSON.
    Json,
}

/// DistDB sync command-line tools.
#[derive(Parser)]
#[command(name = "distdb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decode a packet file
    Inspect {
        /// File holding one encoded packet
        file: PathBuf,

        /// Packet kind stored in the file
        #[arg(short, long, value_enum, default_value = "request")]
        kind: PacketKind,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Sync two in-memory devices over a loopback link
    Simulate {
        /// Records seeded on each sending device
        #[arg(short, long, default_value = "100")]
        records: usize,

        /// Exchange started by the first device
        #[arg(short, long, value_enum, default_value = "push")]
        mode: SimulationMode,

        /// Item cap per packet
        #[arg(long)]
        pack_size: Option<usize>,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Inspect { file, kind, format } => {
            commands::inspect::run(&file, kind, format)?;
        }
        Commands::Simulate {
            records,
            mode,
            pack_size,
            format,
        } => {
            commands::simulate::run(records, mode, pack_size, format)?;
        }
        Commands::Version => {
            println!("DistDB CLI v{}", env!("CARGO_PKG_VERSION"));
            println!(
                "Sync protocol versions {}..={}",
                distdb_codec::SOFTWARE_VERSION_EARLIEST,
                distdb_codec::SOFTWARE_VERSION_CURRENT
            );
        }
    }

    Ok(())
}
