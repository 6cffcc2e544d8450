//! Data acknowledgement packet.

use distdb_codec::{
    align8, encode_exact, has_packet_id, CodecError, CodecResult, LenCounter, Parcel, ParcelSink,
    SOFTWARE_VERSION_CURRENT,
};
use serde::Serialize;

use crate::codes::SyncCode;

/// Returns true for a usable packet id.
pub fn is_packet_id_valid(packet_id: u64) -> bool {
    packet_id > 0
}

/// Acknowledgement of a [`DataRequestPacket`](crate::DataRequestPacket).
///
/// `reserved[0]` echoes the requester's local watermark and `reserved[1]`
/// the packet id being acknowledged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DataAckPacket {
    /// Software version of the acknowledging side.
    pub version: u32,
    /// Ack value, usually the next expected timestamp.
    pub data: u64,
    /// Result of processing the request.
    pub recv_code: SyncCode,
    /// Extension slots.
    pub reserved: Vec<u64>,
}

impl Default for DataAckPacket {
    fn default() -> Self {
        Self {
            version: SOFTWARE_VERSION_CURRENT,
            data: 0,
            recv_code: SyncCode::Ok,
            reserved: Vec::new(),
        }
    }
}

impl DataAckPacket {
    /// Creates an ack with `recv_code` at `version`.
    pub fn new(version: u32, recv_code: SyncCode) -> Self {
        Self {
            version,
            recv_code,
            ..Self::default()
        }
    }

    /// Sets the ack value.
    #[must_use]
    pub fn with_data(mut self, data: u64) -> Self {
        self.data = data;
        self
    }

    /// Fills the reserved slots. The packet id is appended only when the
    /// version carries packet ids and the id is valid.
    pub fn set_echo(&mut self, local_water_mark: u64, packet_id: u64) {
        self.reserved = vec![local_water_mark];
        if has_packet_id(self.version) && is_packet_id_valid(packet_id) {
            self.reserved.push(packet_id);
        }
    }

    /// Echoed local watermark, if present.
    pub fn local_water_mark(&self) -> Option<u64> {
        self.reserved.first().copied()
    }

    /// Echoed packet id, or 0 when absent.
    pub fn packet_id(&self) -> u64 {
        self.reserved.get(1).copied().unwrap_or(0)
    }

    /// Writes the packet.
    pub fn write_to<S: ParcelSink + ?Sized>(&self, sink: &mut S) -> CodecResult<()> {
        sink.write_u32(self.version)?;
        sink.write_u64(self.data)?;
        sink.write_i32(self.recv_code.code())?;
        sink.write_u64_vec(&self.reserved)?;
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

    /// Decodes a packet. A newer version yields only the version and
    /// [`SyncCode::VersionNotSupport`].
    pub fn deserialize(bytes: &[u8]) -> CodecResult<Self> {
        let mut parcel = Parcel::new(bytes);
        parcel.status()?;
        let version = parcel.read_u32()?;
        if version > SOFTWARE_VERSION_CURRENT {
            return Ok(Self::new(version, SyncCode::VersionNotSupport));
        }
        let data = parcel.read_u64()?;
        let recv_code = SyncCode::from_code(parcel.read_i32()?);
        let reserved = parcel.read_u64_vec()?;
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
            recv_code,
            reserved,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use distdb_codec::SOFTWARE_VERSION_RELEASE_2_0;
    use proptest::prelude::*;

    #[test]
    fn roundtrip_with_packet_id() {
        let mut ack = DataAckPacket::new(SOFTWARE_VERSION_CURRENT, SyncCode::Ok).with_data(102);
        ack.set_echo(0, 4);
        let bytes = ack.serialize().unwrap();
        assert_eq!(bytes.len(), ack.calculate_len().unwrap());
        assert_eq!(bytes.len(), 40);

        let decoded = DataAckPacket::deserialize(&bytes).unwrap();
        assert_eq!(decoded, ack);
        assert_eq!(decoded.packet_id(), 4);
        assert_eq!(decoded.local_water_mark(), Some(0));
    }

    #[test]
    fn packet_id_skipped_for_old_versions() {
        let mut ack = DataAckPacket::new(SOFTWARE_VERSION_RELEASE_2_0, SyncCode::Ok);
        ack.set_echo(9, 4);
        assert_eq!(ack.reserved, vec![9]);
        assert_eq!(ack.packet_id(), 0);
    }

    #[test]
    fn invalid_packet_id_not_echoed() {
        let mut ack = DataAckPacket::new(SOFTWARE_VERSION_CURRENT, SyncCode::Ok);
        ack.set_echo(9, 0);
        assert_eq!(ack.reserved, vec![9]);
        assert!(!is_packet_id_valid(ack.packet_id()));
    }

    #[test]
    fn newer_version_short_circuits() {
        let mut bytes = vec![0u8; 24];
        bytes[..4].copy_from_slice(&999u32.to_be_bytes());
        let ack = DataAckPacket::deserialize(&bytes).unwrap();
        assert_eq!(ack.recv_code, SyncCode::VersionNotSupport);
        assert_eq!(ack.version, 999);
    }

    #[test]
    fn negative_codes_survive_the_wire() {
        let ack = DataAckPacket::new(SOFTWARE_VERSION_CURRENT, SyncCode::NotPermit);
        let decoded = DataAckPacket::deserialize(&ack.serialize().unwrap()).unwrap();
        assert_eq!(decoded.recv_code, SyncCode::NotPermit);
    }

    #[test]
    fn truncated_ack_fails() {
        let ack = DataAckPacket::new(SOFTWARE_VERSION_CURRENT, SyncCode::Ok);
        let bytes = ack.serialize().unwrap();
        assert!(DataAckPacket::deserialize(&bytes[..8]).is_err());
    }

    proptest! {
        #[test]
        fn encoded_ack_is_aligned(
            version in SOFTWARE_VERSION_RELEASE_2_0..=SOFTWARE_VERSION_CURRENT,
            data in any::<u64>(),
            mark in any::<u64>(),
            packet_id in any::<u64>(),
        ) {
            let mut ack = DataAckPacket::new(version, SyncCode::Ok).with_data(data);
            ack.set_echo(mark, packet_id);
            let bytes = ack.serialize().unwrap();
            prop_assert_eq!(bytes.len() % 8, 0);
            prop_assert_eq!(DataAckPacket::deserialize(&bytes).unwrap(), ack);
        }
    }
}
