//! Protocol software versions.
//!
//! Peers exchange a software version with every packet. The working version
//! of an exchange is `min(remote, SOFTWARE_VERSION_CURRENT)`; fields newer than
//! [`SOFTWARE_VERSION_RELEASE_2_0`] are only written when it is exceeded.

use crate::error::{CodecError, CodecResult};

/// Versions at or below this value are unknown to the protocol.
pub const SOFTWARE_VERSION_BASE: u32 = 100;
/// First release of the sync protocol.
pub const SOFTWARE_VERSION_RELEASE_1_0: u32 = SOFTWARE_VERSION_BASE + 1;
/// Adds the separate write timestamp to entries.
pub const SOFTWARE_VERSION_RELEASE_2_0: u32 = SOFTWARE_VERSION_BASE + 2;
/// Adds packet ids, the request flag word and security label checks.
pub const SOFTWARE_VERSION_RELEASE_3_0: u32 = SOFTWARE_VERSION_BASE + 3;
/// Oldest version this build can talk to.
pub const SOFTWARE_VERSION_EARLIEST: u32 = SOFTWARE_VERSION_RELEASE_1_0;
/// Version this build speaks.
pub const SOFTWARE_VERSION_CURRENT: u32 = SOFTWARE_VERSION_RELEASE_3_0;

/// Working version for an exchange with a peer advertising `remote`.
pub fn negotiate(remote: u32) -> u32 {
    remote.min(SOFTWARE_VERSION_CURRENT)
}

/// Returns true if `version` lies within `[EARLIEST, CURRENT]`.
pub fn is_supported(version: u32) -> bool {
    (SOFTWARE_VERSION_EARLIEST..=SOFTWARE_VERSION_CURRENT).contains(&version)
}

/// Fails with a version error unless `version` is supported.
pub fn ensure_supported(version: u32) -> CodecResult<u32> {
    if is_supported(version) {
        Ok(version)
    } else {
        Err(CodecError::version_not_supported(version))
    }
}

/// Returns true if packet ids, flag words and security checks apply.
pub fn has_packet_id(version: u32) -> bool {
    version > SOFTWARE_VERSION_RELEASE_2_0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiation_caps_at_current() {
        assert_eq!(negotiate(SOFTWARE_VERSION_RELEASE_2_0), SOFTWARE_VERSION_RELEASE_2_0);
        assert_eq!(negotiate(250), SOFTWARE_VERSION_CURRENT);
    }

    #[test]
    fn supported_range() {
        assert!(!is_supported(SOFTWARE_VERSION_BASE));
        assert!(is_supported(SOFTWARE_VERSION_EARLIEST));
        assert!(is_supported(SOFTWARE_VERSION_CURRENT));
        assert!(!is_supported(SOFTWARE_VERSION_CURRENT + 1));
        assert_eq!(
            ensure_supported(99),
            Err(CodecError::VersionNotSupported { version: 99 })
        );
    }

    #[test]
    fn packet_id_starts_after_release_2() {
        assert!(!has_packet_id(SOFTWARE_VERSION_RELEASE_2_0));
        assert!(has_packet_id(SOFTWARE_VERSION_RELEASE_3_0));
    }
}
