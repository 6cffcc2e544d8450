//! Device identifier hashing.

use sha2::{Digest, Sha256};

/// Hashes a device identifier into its stored and transmitted form.
///
/// The result is the lowercase hex SHA-256 digest of the identifier.
pub fn hash_device_id(device: &str) -> String {
    let digest = Sha256::digest(device.as_bytes());
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

/// Shortened identifier for log output.
pub fn short_device_id(device: &str) -> String {
    let hashed = hash_device_id(device);
    hashed[..8].to_string()
}
