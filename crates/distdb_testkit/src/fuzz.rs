//! Fuzz harnesses for the wire decoders.
//!
//! Each target accepts arbitrary bytes and must either decode or return an
//! error; a panic is a bug. The targets can be driven by cargo-fuzz or by
//! proptest.

use distdb_codec::{deserialize_datas, Parcel, SOFTWARE_VERSION_CURRENT};
use distdb_sync_protocol::{DataAckPacket, DataRequestPacket};

/// Fuzz target for the request decoder.
///
/// A packet that decodes must encode again, unless it was downgraded to a
/// version-not-supported stub.
pub fn fuzz_request_decode(data: &[u8]) {
    if let Ok(packet) = DataRequestPacket::deserialize(data) {
        if packet.version <= SOFTWARE_VERSION_CURRENT {
            let encoded = packet.serialize().expect("decoded packet must encode");
            assert_eq!(encoded.len() % 8, 0, "encoding must stay aligned");
        }
    }
}

/// Fuzz target for the ack decoder.
pub fn fuzz_ack_decode(data: &[u8]) {
    if let Ok(packet) = DataAckPacket::deserialize(data) {
        let _ = packet.serialize();
    }
}

/// Fuzz target for the entry batch decoder.
pub fn fuzz_entries_decode(data: &[u8]) {
    let _ = deserialize_datas(data);
}

/// Fuzz target for raw parcel reads: interprets `data` as a script of read
/// operations against itself.
pub fn fuzz_parcel_reads(data: &[u8]) {
    let mut parcel = Parcel::new(data);
    for op in data.iter().take(64) {
        let failed = match op % 6 {
            0 => parcel.read_u32().is_err(),
            1 => parcel.read_u64().is_err(),
            2 => parcel.read_bytes().is_err(),
            3 => parcel.read_string().is_err(),
            4 => parcel.read_u64_vec().is_err(),
            _ => parcel.eight_byte_align().is_err(),
        };
        if failed {
            assert!(parcel.is_error(), "failed read must poison the parcel");
            assert!(parcel.read_u32().is_err(), "poisoned parcel must stay failed");
            break;
        }
    }
}

/// Runs every target over `data`.
pub fn fuzz_all(data: &[u8]) {
    fuzz_request_decode(data);
    fuzz_ack_decode(data);
    fuzz_entries_decode(data);
    fuzz_parcel_reads(data);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{sample_items, sample_request};
    use proptest::prelude::*;

    #[test]
    fn fuzz_empty_input() {
        fuzz_all(&[]);
    }

    #[test]
    fn fuzz_valid_request() {
        let bytes = sample_request(sample_items(3, 1)).serialize().unwrap();
        fuzz_all(&bytes);
    }

    #[test]
    fn fuzz_truncated_request() {
        let bytes = sample_request(sample_items(3, 1)).serialize().unwrap();
        for len in 0..bytes.len() {
            fuzz_all(&bytes[..len]);
        }
    }

    proptest! {
        #[test]
        fn decoders_never_panic(data in prop::collection::vec(any::<u8>(), 0..512)) {
            fuzz_all(&data);
        }
    }
}
