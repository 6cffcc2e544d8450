//! Sync directions.

use std::fmt;

use serde::Serialize;

/// Direction of a sync exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SyncMode {
    /// Send local changes.
    Push,
    /// Request the peer's changes.
    Pull,
    /// Send local changes and request the peer's in one round trip.
    PushAndPull,
    /// Answer a peer's pull by streaming local changes.
    ResponsePull,
}

impl SyncMode {
    /// Wire value.
    pub fn code(self) -> i32 {
        match self {
            Self::Push => 0,
            Self::Pull => 1,
            Self::PushAndPull => 2,
            Self::ResponsePull => 3,
        }
    }

    /// Maps a wire value back to a mode.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Push),
            1 => Some(Self::Pull),
            2 => Some(Self::PushAndPull),
            3 => Some(Self::ResponsePull),
            _ => None,
        }
    }

    /// Returns true if this side sends its own changes.
    pub fn sends_data(self) -> bool {
        !matches!(self, Self::Pull)
    }

    /// Returns true if the peer is asked to return its changes.
    pub fn requests_data(self) -> bool {
        matches!(self, Self::Pull | Self::PushAndPull)
    }
}

impl Default for SyncMode {
    fn default() -> Self {
        Self::Push
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Push => "PUSH",
            Self::Pull => "PULL",
            Self::PushAndPull => "PUSH_AND_PULL",
            Self::ResponsePull => "RESPONSE_PULL",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_codes() {
        for mode in [
            SyncMode::Push,
            SyncMode::Pull,
            SyncMode::PushAndPull,
            SyncMode::ResponsePull,
        ] {
            assert_eq!(SyncMode::from_code(mode.code()), Some(mode));
        }
        assert_eq!(SyncMode::from_code(9), None);
    }

    #[test]
    fn directions() {
        assert!(SyncMode::Push.sends_data());
        assert!(!SyncMode::Pull.sends_data());
        assert!(SyncMode::PushAndPull.requests_data());
        assert!(!SyncMode::ResponsePull.requests_data());
    }
}
