//! Data request packet.

use distdb_codec::{
    align8, encode_exact, has_packet_id, read_datas, write_datas, CodecError, CodecResult,
    DataItem, LenCounter, Parcel, ParcelSink, SOFTWARE_VERSION_CURRENT,
};
use serde::Serialize;

use crate::codes::SyncCode;
use crate::mode::SyncMode;

/// Flag bit marking the final fragment of an exchange.
pub const IS_LAST_SEQUENCE: u32 = 0x1;

/// A batch of changes plus the watermarks of one exchange step.
///
/// Wire layout: `version | batch | end | local | peer | sendCode | mode |
/// sessionId | reserved | [flag]`, 8-byte aligned. `reserved[0]` carries the
/// packet id and the flag word is present only after release 2.0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DataRequestPacket {
    /// Software version of the sender for this exchange.
    pub version: u32,
    /// Changed records, ascending by timestamp.
    pub data: Vec<DataItem>,
    /// Upper bound the peer should return data up to.
    pub end_water_mark: u64,
    /// Sender's local watermark toward the peer.
    pub local_water_mark: u64,
    /// Sender's view of the peer watermark.
    pub peer_water_mark: u64,
    /// Result code of the sender.
    pub send_code: SyncCode,
    /// Exchange direction.
    pub mode: SyncMode,
    /// Session the packet belongs to.
    pub session_id: u32,
    /// Extension slots; slot 0 is the packet id.
    pub reserved: Vec<u64>,
    /// Bit field of [`IS_LAST_SEQUENCE`].
    pub flag: u32,
}

impl Default for DataRequestPacket {
    fn default() -> Self {
        Self {
            version: SOFTWARE_VERSION_CURRENT,
            data: Vec::new(),
            end_water_mark: 0,
            local_water_mark: 0,
            peer_water_mark: 0,
            send_code: SyncCode::Ok,
            mode: SyncMode::Push,
            session_id: 0,
            reserved: Vec::new(),
            flag: 0,
        }
    }
}

impl DataRequestPacket {
    /// Creates an empty packet at `version`.
    pub fn new(version: u32) -> Self {
        Self {
            version,
            ..Self::default()
        }
    }

    /// Sets the fields every request carries.
    pub fn set_basic_info(
        &mut self,
        send_code: SyncCode,
        version: u32,
        local_water_mark: u64,
        peer_water_mark: u64,
        mode: SyncMode,
    ) {
        self.send_code = send_code;
        self.version = version;
        self.local_water_mark = local_water_mark;
        self.peer_water_mark = peer_water_mark;
        self.mode = mode;
    }

    /// Marks the packet as the final fragment.
    pub fn set_last_sequence(&mut self) {
        self.flag |= IS_LAST_SEQUENCE;
    }

    /// Returns true for the final fragment.
    pub fn is_last_sequence(&self) -> bool {
        self.flag & IS_LAST_SEQUENCE != 0
    }

    /// Stores `packet_id` in reserved slot 0.
    pub fn set_packet_id(&mut self, packet_id: u64) {
        self.reserved = vec![packet_id];
    }

    /// Packet id from reserved slot 0, or 0 when absent.
    pub fn packet_id(&self) -> u64 {
        self.reserved.first().copied().unwrap_or(0)
    }

    /// Largest record timestamp in the batch, or 0 for an empty batch.
    pub fn max_timestamp(&self) -> u64 {
        self.data.iter().map(|item| item.timestamp).max().unwrap_or(0)
    }

    /// Takes ownership of the batch.
    pub fn into_data(self) -> Vec<DataItem> {
        self.data
    }

    /// Writes the packet.
    pub fn write_to<S: ParcelSink + ?Sized>(&self, sink: &mut S) -> CodecResult<()> {
        sink.write_u32(self.version)?;
        write_datas(sink, &self.data, self.version)?;
        sink.write_u64(self.end_water_mark)?;
        sink.write_u64(self.local_water_mark)?;
        sink.write_u64(self.peer_water_mark)?;
        sink.write_i32(self.send_code.code())?;
        sink.write_i32(self.mode.code())?;
        sink.write_u32(self.session_id)?;
        sink.write_u64_vec(&self.reserved)?;
        if has_packet_id(self.version) {
            sink.write_u32(self.flag)?;
        }
        sink.eight_byte_align()
    }

    /// Exact encoded length.
    pub fn calculate_len(&self) -> CodecResult<usize> {
        let mut counter = LenCounter::new();
        self.write_to(&mut counter)?;
        Ok(counter.len())
    }

    /// Encodes the packet into a freshly sized buffer.
    pub fn serialize(&self) -> CodecResult<Vec<u8>> {
        encode_exact(|sink| self.write_to(sink))
    }

    /// Decodes a packet.
    ///
    /// A version newer than this build yields a packet that carries only the
    /// version and [`SyncCode::VersionNotSupport`].
    ///
    /// # Errors
    ///
    /// Fails on malformed data or when the aligned consumed length differs
    /// from `bytes.len()`.
    pub fn deserialize(bytes: &[u8]) -> CodecResult<Self> {
        let mut parcel = Parcel::new(bytes);
        parcel.status()?;
        let version = parcel.read_u32()?;
        if version > SOFTWARE_VERSION_CURRENT {
            return Ok(Self {
                version,
                send_code: SyncCode::VersionNotSupport,
                ..Self::default()
            });
        }
        let data = read_datas(&mut parcel)?;
        let end_water_mark = parcel.read_u64()?;
        let local_water_mark = parcel.read_u64()?;
        let peer_water_mark = parcel.read_u64()?;
        let send_code = SyncCode::from_code(parcel.read_i32()?);
        let raw_mode = parcel.read_i32()?;
        let mode = SyncMode::from_code(raw_mode)
            .ok_or_else(|| CodecError::decoding_failed(format!("unknown sync mode {raw_mode}")))?;
        let session_id = parcel.read_u32()?;
        let reserved = parcel.read_u64_vec()?;
        let flag = if has_packet_id(version) {
            parcel.read_u32()?
        } else {
            0
        };
        let consumed = align8(parcel.position());
        if consumed != bytes.len() {
            return Err(CodecError::LengthMismatch {
                expected: bytes.len(),
                actual: consumed,
            });
        }
        Ok(Self {
            version,
            data,
            end_water_mark,
            local_water_mark,
            peer_water_mark,
            send_code,
            mode,
            session_id,
            reserved,
            flag,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use distdb_codec::{SOFTWARE_VERSION_EARLIEST, SOFTWARE_VERSION_RELEASE_2_0};

    fn packet(version: u32) -> DataRequestPacket {
        let mut packet = DataRequestPacket::new(version);
        packet.data = vec![
            DataItem::new(b"k1".to_vec(), b"v1".to_vec(), 100),
            DataItem::new(b"k2".to_vec(), b"v2".to_vec(), 101),
        ];
        packet.set_basic_info(SyncCode::Ok, version, 0, 7, SyncMode::PushAndPull);
        packet.end_water_mark = 300;
        packet.session_id = 11;
        packet.set_packet_id(3);
        packet.set_last_sequence();
        packet
    }

    #[test]
    fn roundtrip_current() {
        let packet = packet(SOFTWARE_VERSION_CURRENT);
        let bytes = packet.serialize().unwrap();
        assert_eq!(bytes.len(), packet.calculate_len().unwrap());
        assert_eq!(bytes.len() % 8, 0);

        let decoded = DataRequestPacket::deserialize(&bytes).unwrap();
        assert_eq!(decoded, packet);
        assert!(decoded.is_last_sequence());
        assert_eq!(decoded.packet_id(), 3);
        assert_eq!(decoded.max_timestamp(), 101);
    }

    #[test]
    fn release_2_omits_flag_word() {
        let packet = packet(SOFTWARE_VERSION_RELEASE_2_0);
        let bytes = packet.serialize().unwrap();
        let decoded = DataRequestPacket::deserialize(&bytes).unwrap();
        assert!(!decoded.is_last_sequence());
        assert_eq!(decoded.data, packet.data);
    }

    #[test]
    fn earliest_packet_drops_write_timestamps() {
        let mut packet = packet(SOFTWARE_VERSION_EARLIEST);
        packet.data[0].write_timestamp = 42;
        let bytes = packet.serialize().unwrap();
        let decoded = DataRequestPacket::deserialize(&bytes).unwrap();
        assert_eq!(decoded.data[0].write_timestamp, 100);
    }

    #[test]
    fn newer_version_short_circuits() {
        let mut bytes = vec![0u8; 8];
        bytes[..4].copy_from_slice(&(SOFTWARE_VERSION_CURRENT + 5).to_be_bytes());
        let decoded = DataRequestPacket::deserialize(&bytes).unwrap();
        assert_eq!(decoded.version, SOFTWARE_VERSION_CURRENT + 5);
        assert_eq!(decoded.send_code, SyncCode::VersionNotSupport);
        assert!(decoded.data.is_empty());
    }

    #[test]
    fn trailing_bytes_are_a_length_error() {
        let mut bytes = packet(SOFTWARE_VERSION_CURRENT).serialize().unwrap();
        bytes.extend_from_slice(&[0u8; 8]);
        assert!(matches!(
            DataRequestPacket::deserialize(&bytes),
            Err(CodecError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn unknown_mode_is_rejected() {
        let mut packet = packet(SOFTWARE_VERSION_CURRENT);
        packet.data.clear();
        let mut bytes = packet.serialize().unwrap();
        // version(4) + batch(4 + align) + three marks + sendCode, then mode
        let mode_offset = 8 + 24 + 4;
        bytes[mode_offset..mode_offset + 4].copy_from_slice(&77i32.to_be_bytes());
        assert!(matches!(
            DataRequestPacket::deserialize(&bytes),
            Err(CodecError::DecodingFailed { .. })
        ));
    }

    #[test]
    fn empty_buffer_fails() {
        assert_eq!(
            DataRequestPacket::deserialize(&[]),
            Err(CodecError::EmptyBuffer)
        );
    }
}
