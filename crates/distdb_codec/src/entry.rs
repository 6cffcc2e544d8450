//! Versioned codec for changed key-value records.
//!
//! An entry is written as a `u32` version tag followed by the fields the
//! version defines. The field list per version lives in one table that drives
//! both encoding and length calculation.

use serde::{Deserialize, Serialize};

use crate::error::{CodecError, CodecResult};
use crate::parcel::{encode_exact, LenCounter, Parcel, ParcelSink};
use crate::version::{ensure_supported, SOFTWARE_VERSION_EARLIEST};

/// Flag bit marking a tombstone.
pub const DELETE_FLAG: u64 = 0x01;
/// Flag bit marking a record written on this device.
pub const LOCAL_FLAG: u64 = 0x02;

/// Largest key accepted, in bytes.
pub const MAX_KEY_SIZE: usize = 1024;
/// Largest value accepted, in bytes.
pub const MAX_VALUE_SIZE: usize = 4 * 1024 * 1024;
/// Largest device identifier accepted, in bytes.
pub const MAX_DEVICE_ID_LEN: usize = 128;
/// Largest batch accepted by user-facing batch writes.
pub const MAX_BATCH_SIZE: usize = 128;
/// Largest entry count a received sync batch may claim.
pub const MAX_SYNC_BATCH_ITEMS: u32 = 1_000_000;

/// One changed record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataItem {
    /// Record key.
    pub key: Vec<u8>,
    /// Record value; empty for tombstones.
    pub value: Vec<u8>,
    /// Sync timestamp, the watermark unit.
    pub timestamp: u64,
    /// Timestamp of the last local write of this value.
    pub write_timestamp: u64,
    /// Bit field of [`DELETE_FLAG`] and [`LOCAL_FLAG`].
    pub flag: u64,
    /// Device that first authored the record. Empty means this device.
    pub orig_device: String,
}

impl DataItem {
    /// Creates a live record stamped at `timestamp`.
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>, timestamp: u64) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            timestamp,
            write_timestamp: timestamp,
            flag: 0,
            orig_device: String::new(),
        }
    }

    /// Creates a tombstone for `key` stamped at `timestamp`.
    pub fn tombstone(key: impl Into<Vec<u8>>, timestamp: u64) -> Self {
        Self {
            flag: DELETE_FLAG,
            ..Self::new(key, Vec::new(), timestamp)
        }
    }

    /// Sets the origin device.
    #[must_use]
    pub fn with_orig_device(mut self, device: impl Into<String>) -> Self {
        self.orig_device = device.into();
        self
    }

    /// Sets the write timestamp.
    #[must_use]
    pub fn with_write_timestamp(mut self, write_timestamp: u64) -> Self {
        self.write_timestamp = write_timestamp;
        self
    }

    /// Returns true for tombstones.
    pub fn is_deleted(&self) -> bool {
        self.flag & DELETE_FLAG != 0
    }

    /// Returns true for records written on this device.
    pub fn is_local(&self) -> bool {
        self.flag & LOCAL_FLAG != 0
    }
}

/// A field of an encoded entry, in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryField {
    /// Key bytes.
    Key,
    /// Value bytes.
    Value,
    /// Sync timestamp.
    Timestamp,
    /// Flag word.
    Flag,
    /// Origin device string.
    OrigDevice,
    /// Write timestamp.
    WriteTimestamp,
}

const FIRST_VERSION_FIELDS: &[EntryField] = &[
    EntryField::Key,
    EntryField::Value,
    EntryField::Timestamp,
    EntryField::Flag,
    EntryField::OrigDevice,
];

const WRITE_TIMESTAMP_FIELDS: &[EntryField] = &[
    EntryField::Key,
    EntryField::Value,
    EntryField::Timestamp,
    EntryField::Flag,
    EntryField::OrigDevice,
    EntryField::WriteTimestamp,
];

/// Field layout of an entry at `version`.
///
/// # Errors
///
/// Fails for versions outside the supported range.
pub fn entry_fields(version: u32) -> CodecResult<&'static [EntryField]> {
    let version = ensure_supported(version)?;
    if version > SOFTWARE_VERSION_EARLIEST {
        Ok(WRITE_TIMESTAMP_FIELDS)
    } else {
        Ok(FIRST_VERSION_FIELDS)
    }
}

/// Writes one entry tagged with `version`.
pub fn write_data<S: ParcelSink + ?Sized>(
    sink: &mut S,
    item: &DataItem,
    version: u32,
) -> CodecResult<()> {
    let fields = entry_fields(version)?;
    sink.write_u32(version)?;
    for field in fields {
        match field {
            EntryField::Key => sink.write_bytes(&item.key)?,
            EntryField::Value => sink.write_bytes(&item.value)?,
            EntryField::Timestamp => sink.write_u64(item.timestamp)?,
            EntryField::Flag => sink.write_u64(item.flag)?,
            EntryField::OrigDevice => sink.write_string(&item.orig_device)?,
            EntryField::WriteTimestamp => {
                let write_timestamp = if item.write_timestamp == 0 {
                    item.timestamp
                } else {
                    item.write_timestamp
                };
                sink.write_u64(write_timestamp)?;
            }
        }
    }
    Ok(())
}

/// Reads one entry, dispatching on its embedded version tag.
pub fn read_data<B: AsRef<[u8]>>(parcel: &mut Parcel<B>) -> CodecResult<DataItem> {
    let version = parcel.read_u32()?;
    let fields = entry_fields(version)?;
    let mut item = DataItem::default();
    for field in fields {
        match field {
            EntryField::Key => item.key = parcel.read_bytes()?,
            EntryField::Value => item.value = parcel.read_bytes()?,
            EntryField::Timestamp => item.timestamp = parcel.read_u64()?,
            EntryField::Flag => item.flag = parcel.read_u64()?,
            EntryField::OrigDevice => item.orig_device = parcel.read_string()?,
            EntryField::WriteTimestamp => item.write_timestamp = parcel.read_u64()?,
        }
    }
    if !fields.contains(&EntryField::WriteTimestamp) {
        item.write_timestamp = item.timestamp;
    }
    Ok(item)
}

/// Exact encoded length of one entry at `version`.
pub fn calculate_len(item: &DataItem, version: u32) -> CodecResult<usize> {
    let mut counter = LenCounter::new();
    write_data(&mut counter, item, version)?;
    Ok(counter.len())
}

/// Encodes one entry into a freshly sized buffer.
pub fn serialize_data(item: &DataItem, version: u32) -> CodecResult<Vec<u8>> {
    encode_exact(|sink| write_data(sink, item, version))
}

/// Decodes one entry from `bytes`.
pub fn deserialize_data(bytes: &[u8]) -> CodecResult<DataItem> {
    let mut parcel = Parcel::new(bytes);
    parcel.status()?;
    read_data(&mut parcel)
}

/// Writes a count-prefixed batch, aligning after the count and every entry.
pub fn write_datas<S: ParcelSink + ?Sized>(
    sink: &mut S,
    items: &[DataItem],
    version: u32,
) -> CodecResult<()> {
    let count = u32::try_from(items.len()).map_err(|_| CodecError::LengthOverflow {
        len: items.len() as u64,
    })?;
    sink.write_u32(count)?;
    sink.eight_byte_align()?;
    for item in items {
        write_data(sink, item, version)?;
        sink.eight_byte_align()?;
    }
    Ok(())
}

/// Reads a batch written by [`write_datas`].
///
/// Any failure drops the entries decoded so far and returns the error.
pub fn read_datas<B: AsRef<[u8]>>(parcel: &mut Parcel<B>) -> CodecResult<Vec<DataItem>> {
    let count = parcel.read_u32()?;
    if count > MAX_SYNC_BATCH_ITEMS {
        return Err(CodecError::BatchTooLarge {
            claimed: u64::from(count),
            max: u64::from(MAX_SYNC_BATCH_ITEMS),
        });
    }
    parcel.eight_byte_align()?;
    let mut items = Vec::with_capacity((count as usize).min(parcel.remaining() / 8));
    for _ in 0..count {
        items.push(read_data(parcel)?);
        parcel.eight_byte_align()?;
    }
    Ok(items)
}

/// Exact length of a batch starting on an 8-byte boundary.
pub fn calculate_lens(items: &[DataItem], version: u32) -> CodecResult<usize> {
    let mut counter = LenCounter::new();
    write_datas(&mut counter, items, version)?;
    Ok(counter.len())
}

/// Encodes a batch into a freshly sized buffer.
pub fn serialize_datas(items: &[DataItem], version: u32) -> CodecResult<Vec<u8>> {
    encode_exact(|sink| write_datas(sink, items, version))
}

/// Decodes a batch from `bytes`.
pub fn deserialize_datas(bytes: &[u8]) -> CodecResult<Vec<DataItem>> {
    let mut parcel = Parcel::new(bytes);
    parcel.status()?;
    read_datas(&mut parcel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::{SOFTWARE_VERSION_CURRENT, SOFTWARE_VERSION_RELEASE_2_0};
    use proptest::prelude::*;

    fn sample() -> DataItem {
        DataItem::new(b"k1".to_vec(), b"v1".to_vec(), 100)
            .with_write_timestamp(90)
            .with_orig_device("remote-device")
    }

    #[test]
    fn roundtrip_current_version() {
        let item = sample();
        let bytes = serialize_data(&item, SOFTWARE_VERSION_CURRENT).unwrap();
        assert_eq!(bytes.len(), calculate_len(&item, SOFTWARE_VERSION_CURRENT).unwrap());
        assert_eq!(deserialize_data(&bytes).unwrap(), item);
    }

    #[test]
    fn roundtrip_at_size_limits() {
        let largest = DataItem::new(vec![0xab; MAX_KEY_SIZE], vec![0xcd; MAX_VALUE_SIZE], 500)
            .with_write_timestamp(500)
            .with_orig_device("d".repeat(MAX_DEVICE_ID_LEN));
        let smallest = DataItem::new(Vec::new(), Vec::new(), 1).with_write_timestamp(1);

        for version in SOFTWARE_VERSION_EARLIEST..=SOFTWARE_VERSION_CURRENT {
            for item in [&largest, &smallest] {
                let bytes = serialize_data(item, version).unwrap();
                assert_eq!(bytes.len(), calculate_len(item, version).unwrap());
                assert_eq!(bytes.len() % 8, 0);
                assert_eq!(&deserialize_data(&bytes).unwrap(), item);
            }
        }

        let batch = vec![largest.clone(), smallest];
        let bytes = serialize_datas(&batch, SOFTWARE_VERSION_CURRENT).unwrap();
        assert_eq!(bytes.len(), calculate_lens(&batch, SOFTWARE_VERSION_CURRENT).unwrap());
        assert_eq!(deserialize_datas(&bytes).unwrap(), batch);
    }

    #[test]
    fn earliest_version_omits_write_timestamp() {
        let item = sample();
        let old = serialize_data(&item, SOFTWARE_VERSION_EARLIEST).unwrap();
        let new = serialize_data(&item, SOFTWARE_VERSION_RELEASE_2_0).unwrap();
        assert_eq!(new.len(), old.len() + 8);

        let decoded = deserialize_data(&old).unwrap();
        assert_eq!(decoded.write_timestamp, decoded.timestamp);
        assert_eq!(decoded.key, item.key);
    }

    #[test]
    fn unset_write_timestamp_defaults_to_timestamp() {
        let item = DataItem::new(b"k".to_vec(), b"v".to_vec(), 7).with_write_timestamp(0);
        let bytes = serialize_data(&item, SOFTWARE_VERSION_CURRENT).unwrap();
        assert_eq!(deserialize_data(&bytes).unwrap().write_timestamp, 7);
    }

    #[test]
    fn unsupported_versions_fail() {
        let item = sample();
        assert_eq!(
            serialize_data(&item, SOFTWARE_VERSION_CURRENT + 1),
            Err(CodecError::VersionNotSupported {
                version: SOFTWARE_VERSION_CURRENT + 1
            })
        );
        assert!(calculate_len(&item, 42).is_err());

        let mut bytes = serialize_data(&item, SOFTWARE_VERSION_CURRENT).unwrap();
        bytes[..4].copy_from_slice(&200u32.to_be_bytes());
        assert!(matches!(
            deserialize_data(&bytes),
            Err(CodecError::VersionNotSupported { version: 200 })
        ));
    }

    #[test]
    fn field_tables_differ_only_by_write_timestamp() {
        let old = entry_fields(SOFTWARE_VERSION_EARLIEST).unwrap();
        let new = entry_fields(SOFTWARE_VERSION_CURRENT).unwrap();
        assert_eq!(&new[..old.len()], old);
        assert_eq!(new.last(), Some(&EntryField::WriteTimestamp));
    }

    #[test]
    fn batch_roundtrip_is_aligned() {
        let items = vec![
            sample(),
            DataItem::tombstone(b"gone".to_vec(), 101),
            DataItem::new(Vec::new(), Vec::new(), 0),
        ];
        let bytes = serialize_datas(&items, SOFTWARE_VERSION_CURRENT).unwrap();
        assert_eq!(bytes.len() % 8, 0);
        assert_eq!(bytes.len(), calculate_lens(&items, SOFTWARE_VERSION_CURRENT).unwrap());

        let decoded = deserialize_datas(&bytes).unwrap();
        assert_eq!(decoded, items);
        assert!(decoded[1].is_deleted());
    }

    #[test]
    fn empty_batch_encodes_count_only() {
        let bytes = serialize_datas(&[], SOFTWARE_VERSION_CURRENT).unwrap();
        assert_eq!(bytes.len(), 8);
        assert!(deserialize_datas(&bytes).unwrap().is_empty());
    }

    #[test]
    fn oversized_batch_claim_is_rejected() {
        let mut bytes = vec![0u8; 64];
        bytes[..4].copy_from_slice(&(MAX_SYNC_BATCH_ITEMS + 1).to_be_bytes());
        assert!(matches!(
            deserialize_datas(&bytes),
            Err(CodecError::BatchTooLarge { .. })
        ));
    }

    #[test]
    fn truncated_batch_is_dropped_whole() {
        let items = vec![sample(), sample()];
        let bytes = serialize_datas(&items, SOFTWARE_VERSION_CURRENT).unwrap();
        let truncated = &bytes[..bytes.len() - 8];
        assert!(deserialize_datas(truncated).is_err());
    }

    #[test]
    fn item_flags() {
        let mut item = DataItem::tombstone(b"k".to_vec(), 1);
        assert!(item.is_deleted());
        assert!(!item.is_local());
        item.flag |= LOCAL_FLAG;
        assert!(item.is_local());
    }

    fn item_strategy() -> impl Strategy<Value = DataItem> {
        (
            prop::collection::vec(any::<u8>(), 0..64),
            prop::collection::vec(any::<u8>(), 0..256),
            any::<u64>(),
            1..u64::MAX,
            0..4u64,
            "[a-z0-9]{0,40}",
        )
            .prop_map(|(key, value, timestamp, write_timestamp, flag, orig_device)| DataItem {
                key,
                value,
                timestamp,
                write_timestamp,
                flag,
                orig_device,
            })
    }

    proptest! {
        #[test]
        fn length_matches_encoding(
            item in item_strategy(),
            version in SOFTWARE_VERSION_EARLIEST..=SOFTWARE_VERSION_CURRENT,
        ) {
            let bytes = serialize_data(&item, version).unwrap();
            prop_assert_eq!(bytes.len(), calculate_len(&item, version).unwrap());
        }

        #[test]
        fn roundtrip_preserves_item(
            item in item_strategy(),
            version in SOFTWARE_VERSION_RELEASE_2_0..=SOFTWARE_VERSION_CURRENT,
        ) {
            let bytes = serialize_data(&item, version).unwrap();
            prop_assert_eq!(deserialize_data(&bytes).unwrap(), item);
        }
    }
}
