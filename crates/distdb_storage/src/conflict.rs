//! Conflict resolution for received records.

use std::cmp::Ordering;

use distdb_codec::DataItem;

/// Outcome of comparing a stored record with a received one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictResolution {
    /// Keep the stored record.
    KeepLocal,
    /// Replace it with the received record.
    AcceptRemote,
}

/// Last-write-wins on `timestamp`.
///
/// Equal timestamps fall back to comparing `(write_timestamp, deleted, value)`;
/// the received record wins only when strictly greater, so applying two
/// competing records in either order leaves the same content.
pub fn resolve(existing: &DataItem, incoming: &DataItem) -> ConflictResolution {
    let order = incoming
        .timestamp
        .cmp(&existing.timestamp)
        .then_with(|| tie_break(incoming, existing));
    match order {
        Ordering::Greater => ConflictResolution::AcceptRemote,
        Ordering::Less | Ordering::Equal => ConflictResolution::KeepLocal,
    }
}

fn tie_break(a: &DataItem, b: &DataItem) -> Ordering {
    (a.write_timestamp, a.is_deleted(), a.value.as_slice()).cmp(&(
        b.write_timestamp,
        b.is_deleted(),
        b.value.as_slice(),
    ))
}
