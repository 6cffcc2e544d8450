//! Inspect command implementation.

use clap::ValueEnum;
use distdb_codec::DataItem;
use distdb_sync_protocol::{DataAckPacket, DataRequestPacket};
use serde::Serialize;
use std::fs;
use std::path::Path;

use crate::OutputFormat;

/// Packet kind held in an inspected file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PacketKind {
    /// A data request.
    Request,
    /// A data acknowledgement.
    Ack,
}

/// One record of a decoded request.
#[derive(Debug, Serialize)]
pub struct ItemSummary {
    /// Key, lossily decoded as UTF-8.
    pub key: String,
    /// Value length in bytes.
    pub value_len: usize,
    /// Logical timestamp.
    pub timestamp: u64,
    /// Write timestamp.
    pub write_timestamp: u64,
    /// Tombstone marker.
    pub deleted: bool,
    /// Hashed origin device, empty for the sender's own writes.
    pub orig_device: String,
}

impl From<&DataItem> for ItemSummary {
    fn from(item: &DataItem) -> Self {
        Self {
            key: String::from_utf8_lossy(&item.key).into_owned(),
            value_len: item.value.len(),
            timestamp: item.timestamp,
            write_timestamp: item.write_timestamp,
            deleted: item.is_deleted(),
            orig_device: item.orig_device.clone(),
        }
    }
}

/// Decoded packet file.
#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PacketReport {
    /// A data request.
    Request {
        /// Encoded size in bytes.
        size: usize,
        /// Packet version.
        version: u32,
        /// Sender result code.
        send_code: String,
        /// Exchange direction.
        mode: String,
        /// Session carried in the body.
        session_id: u32,
        /// End watermark of a pull.
        end_water_mark: u64,
        /// Sender's local watermark.
        local_water_mark: u64,
        /// Sender's peer watermark.
        peer_water_mark: u64,
        /// Packet id, 0 when absent.
        packet_id: u64,
        /// Final fragment marker.
        last_sequence: bool,
        /// Records in the batch.
        items: Vec<ItemSummary>,
    },
    /// A data acknowledgement.
    Ack {
        /// Encoded size in bytes.
        size: usize,
        /// Packet version.
        version: u32,
        /// Receiver result code.
        recv_code: String,
        /// Ack value.
        data: u64,
        /// Echoed local watermark.
        local_water_mark: Option<u64>,
        /// Echoed packet id, 0 when absent.
        packet_id: u64,
    },
}

/// Decodes the packet stored at `path`.
pub fn inspect_file(
    path: &Path,
    kind: PacketKind,
) -> Result<PacketReport, Box<dyn std::error::Error>> {
    let bytes = fs::read(path)?;
    let size = bytes.len();
    let report = match kind {
        PacketKind::Request => {
            let packet = DataRequestPacket::deserialize(&bytes)?;
            PacketReport::Request {
                size,
                version: packet.version,
                send_code: packet.send_code.to_string(),
                mode: packet.mode.to_string(),
                session_id: packet.session_id,
                end_water_mark: packet.end_water_mark,
                local_water_mark: packet.local_water_mark,
                peer_water_mark: packet.peer_water_mark,
                packet_id: packet.packet_id(),
                last_sequence: packet.is_last_sequence(),
                items: packet.data.iter().map(ItemSummary::from).collect(),
            }
        }
        PacketKind::Ack => {
            let packet = DataAckPacket::deserialize(&bytes)?;
            PacketReport::Ack {
                size,
                version: packet.version,
                recv_code: packet.recv_code.to_string(),
                data: packet.data,
                local_water_mark: packet.local_water_mark(),
                packet_id: packet.packet_id(),
            }
        }
    };
    Ok(report)
}

/// Runs the inspect command.
pub fn run(
    path: &Path,
    kind: PacketKind,
    format: OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("No packet file at {:?}", path).into());
    }
    let report = inspect_file(path, kind)?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => print!("{}", render_text(path, &report)),
    }
    Ok(())
}

fn short(hashed: &str) -> &str {
    if hashed.is_empty() {
        "-"
    } else {
        hashed.get(..8).unwrap_or(hashed)
    }
}

fn render_text(path: &Path, report: &PacketReport) -> String {
    let mut out = String::new();
    match report {
        PacketReport::Request {
            size,
            version,
            send_code,
            mode,
            session_id,
            end_water_mark,
            local_water_mark,
            peer_water_mark,
            packet_id,
            last_sequence,
            items,
        } => {
            out.push_str("DistDB Data Request\n");
            out.push_str("===================\n\n");
            out.push_str(&format!("Path:        {}\n", path.display()));
            out.push_str(&format!("Size:        {size} bytes\n"));
            out.push_str(&format!("Version:     {version}\n"));
            out.push_str(&format!("Send code:   {send_code}\n"));
            out.push_str(&format!("Mode:        {mode}\n"));
            out.push_str(&format!("Session:     {session_id}\n"));
            out.push_str(&format!("Packet id:   {packet_id}\n"));
            out.push_str(&format!("Last page:   {last_sequence}\n\n"));
            out.push_str("Watermarks:\n");
            out.push_str(&format!("  local: {local_water_mark}\n"));
            out.push_str(&format!("  peer:  {peer_water_mark}\n"));
            out.push_str(&format!("  end:   {end_water_mark}\n\n"));
            out.push_str(&format!("Records ({}):\n", items.len()));
            for item in items {
                out.push_str(&format!(
                    "  [{}] {} ({} bytes){} from {}\n",
                    item.timestamp,
                    item.key,
                    item.value_len,
                    if item.deleted { " deleted" } else { "" },
                    short(&item.orig_device)
                ));
            }
        }
        PacketReport::Ack {
            size,
            version,
            recv_code,
            data,
            local_water_mark,
            packet_id,
        } => {
            out.push_str("DistDB Data Ack\n");
            out.push_str("===============\n\n");
            out.push_str(&format!("Path:        {}\n", path.display()));
            out.push_str(&format!("Size:        {size} bytes\n"));
            out.push_str(&format!("Version:     {version}\n"));
            out.push_str(&format!("Recv code:   {recv_code}\n"));
            out.push_str(&format!("Data:        {data}\n"));
            match local_water_mark {
                Some(mark) => out.push_str(&format!("Echoed mark: {mark}\n")),
                None => out.push_str("Echoed mark: -\n"),
            }
            out.push_str(&format!("Packet id:   {packet_id}\n"));
        }
    }
    out
}
