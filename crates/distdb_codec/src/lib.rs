//! # DistDB Codec
//!
//! Wire encoding for DistDB device-to-device sync.
//!
//! This crate provides:
//! - [`Parcel`], a bounds-checked big-endian cursor with 8-byte alignment and
//!   error-sticky semantics
//! - [`LenCounter`], which sizes a message by running the same encoding routine
//! - [`DataItem`] and its versioned entry codec
//! - Protocol software version constants
//!
//! ## Usage
//!
//! ```
//! use distdb_codec::{deserialize_datas, serialize_datas, DataItem, SOFTWARE_VERSION_CURRENT};
//!
//! let items = vec![DataItem::new(b"k1".to_vec(), b"v1".to_vec(), 100)];
//! let bytes = serialize_datas(&items, SOFTWARE_VERSION_CURRENT).unwrap();
//! assert_eq!(bytes.len() % 8, 0);
//! assert_eq!(deserialize_datas(&bytes).unwrap(), items);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod entry;
mod error;
mod parcel;
mod version;

pub use entry::{
    calculate_len, calculate_lens, deserialize_data, deserialize_datas, entry_fields, read_data,
    read_datas, serialize_data, serialize_datas, write_data, write_datas, DataItem, EntryField,
    DELETE_FLAG, LOCAL_FLAG, MAX_BATCH_SIZE, MAX_DEVICE_ID_LEN, MAX_KEY_SIZE,
    MAX_SYNC_BATCH_ITEMS, MAX_VALUE_SIZE,
};
pub use error::{CodecError, CodecResult};
pub use parcel::{
    align8, bytes_len, encode_exact, string_len, u64_vec_len, LenCounter, Parcel, ParcelSink,
    I32_LEN, MAX_ENCODED_LEN, U32_LEN, U64_LEN,
};
pub use version::{
    ensure_supported, has_packet_id, is_supported, negotiate, SOFTWARE_VERSION_BASE,
    SOFTWARE_VERSION_CURRENT, SOFTWARE_VERSION_EARLIEST, SOFTWARE_VERSION_RELEASE_1_0,
    SOFTWARE_VERSION_RELEASE_2_0, SOFTWARE_VERSION_RELEASE_3_0,
};
