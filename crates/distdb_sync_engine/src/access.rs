//! Permission and device security checks.

use std::collections::{HashMap, HashSet};
use std::ops::BitOr;

use distdb_storage::{SecurityLabel, SecurityOption, StoreProperties};
use distdb_sync_protocol::SyncMode;
use parking_lot::RwLock;

/// Directions a permission check covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PermissionFlags(u8);

impl PermissionFlags {
    /// Data may flow to the peer.
    pub const SEND: Self = Self(0x01);
    /// Data may flow from the peer.
    pub const RECEIVE: Self = Self(0x02);

    /// Flags a received request of `mode` needs.
    pub fn for_mode(mode: SyncMode) -> Self {
        match mode {
            SyncMode::Push => Self::RECEIVE,
            SyncMode::Pull => Self::SEND,
            SyncMode::PushAndPull => Self::SEND | Self::RECEIVE,
            SyncMode::ResponsePull => Self::RECEIVE,
        }
    }

    /// Returns true if every bit of `other` is set.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Raw bits.
    pub fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr for PermissionFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Access policy consulted before data is accepted or produced.
pub trait AccessControl: Send + Sync {
    /// Returns true if the store may exchange data with `device` in `flags`.
    fn check_permission(
        &self,
        properties: &StoreProperties,
        device: &str,
        flags: PermissionFlags,
    ) -> bool;

    /// Returns true if `device` may hold data classified as `option`.
    fn check_device_security_ability(&self, device: &str, option: SecurityOption) -> bool;
}

/// Permits everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessControl for AllowAll {
    fn check_permission(&self, _: &StoreProperties, _: &str, _: PermissionFlags) -> bool {
        true
    }

    fn check_device_security_ability(&self, _: &str, _: SecurityOption) -> bool {
        true
    }
}

/// A table-driven policy.
///
/// Denied `(device, flags)` pairs fail the permission check. A device with a
/// registered label may hold data up to that label; unregistered devices may
/// hold anything.
#[derive(Debug, Default)]
pub struct StaticAccessControl {
    denied: RwLock<HashSet<(String, u8)>>,
    device_labels: RwLock<HashMap<String, SecurityLabel>>,
}

impl StaticAccessControl {
    /// Creates a policy that permits everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Denies `flags` toward `device`.
    pub fn deny(&self, device: impl Into<String>, flags: PermissionFlags) {
        self.denied.write().insert((device.into(), flags.bits()));
    }

    /// Sets the highest label `device` may hold.
    pub fn set_device_label(&self, device: impl Into<String>, label: SecurityLabel) {
        self.device_labels.write().insert(device.into(), label);
    }
}

impl AccessControl for StaticAccessControl {
    fn check_permission(
        &self,
        _properties: &StoreProperties,
        device: &str,
        flags: PermissionFlags,
    ) -> bool {
        !self
            .denied
            .read()
            .iter()
            .any(|(denied_device, bits)| denied_device == device && flags.bits() & bits != 0)
    }

    fn check_device_security_ability(&self, device: &str, option: SecurityOption) -> bool {
        match self.device_labels.read().get(device) {
            Some(label) => option.label <= *label,
            None => true,
        }
    }
}
