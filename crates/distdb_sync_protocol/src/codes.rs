//! Result codes carried in `sendCode` and `recvCode`.
//!
//! Non-negative codes are protocol signals; negative codes are errors.

use std::fmt;

use serde::Serialize;

macro_rules! sync_codes {
    ($($(#[$meta:meta])* $name:ident = $value:expr, $label:literal;)*) => {
        /// A protocol result code.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
        pub enum SyncCode {
            $($(#[$meta])* $name,)*
            /// A code this build does not know.
            Other(i32),
        }

        impl SyncCode {
            /// Wire value.
            pub fn code(self) -> i32 {
                match self {
                    $(Self::$name => $value,)*
                    Self::Other(code) => code,
                }
            }

            /// Maps a wire value back to a code.
            pub fn from_code(code: i32) -> Self {
                match code {
                    $(v if v == $value => Self::$name,)*
                    other => Self::Other(other),
                }
            }

            /// Stable upper-case name.
            pub fn name(self) -> &'static str {
                match self {
                    $(Self::$name => $label,)*
                    Self::Other(_) => "UNKNOWN",
                }
            }
        }
    };
}

const ERROR_BASE: i32 = 1000;

sync_codes! {
    /// Success.
    Ok = 0, "OK";
    /// The sender's local watermark is ahead of what the receiver recorded.
    LocalWaterMarkNotInit = 0xaa, "LOCAL_WATER_MARK_NOT_INIT";
    /// The responder has sent its last pull-response page.
    SendFinished = 0xbb, "SEND_FINISHED";
    /// The request carried no data, so the ack value is not a watermark.
    WaterMarkInvalid = 0xcc, "WATER_MARK_INVALID";
    /// Generic storage failure.
    DbError = -(ERROR_BASE + 1), "DB_ERROR";
    /// Caller passed an out-of-range argument.
    InvalidArgs = -(ERROR_BASE + 2), "INVALID_ARGS";
    /// Record or metadata not found.
    NotFound = -(ERROR_BASE + 3), "NOT_FOUND";
    /// Storage is temporarily restricted.
    Busy = -(ERROR_BASE + 4), "BUSY";
    /// Storage is readable only after a pending migration.
    KeyRevoked = -(ERROR_BASE + 5), "EKEYREVOKED";
    /// Version negotiation failed.
    VersionNotSupport = -(ERROR_BASE + 6), "VERSION_NOT_SUPPORT";
    /// The peer must run ability sync before exchanging data.
    NeedAbilitySync = -(ERROR_BASE + 7), "NEED_ABILITY_SYNC";
    /// Permission check rejected the exchange.
    NotPermit = -(ERROR_BASE + 8), "NOT_PERMIT";
    /// Security label check rejected the exchange.
    SecurityOptionCheckError = -(ERROR_BASE + 9), "SECURITY_OPTION_CHECK_ERROR";
    /// More data remains after this page.
    Unfinished = -(ERROR_BASE + 10), "UNFINISHED";
    /// Internal invariant broken.
    InternalError = -(ERROR_BASE + 11), "INTERNAL_ERROR";
    /// Packet length disagrees with its contents.
    LengthError = -(ERROR_BASE + 12), "LENGTH_ERROR";
    /// Malformed wire data.
    ParseError = -(ERROR_BASE + 13), "PARSE_ERROR";
    /// Allocation failed.
    OutOfMemory = -(ERROR_BASE + 14), "OUT_OF_MEMORY";
    /// The exchange timed out.
    Timeout = -(ERROR_BASE + 15), "TIMEOUT";
    /// The receiver is saving a large batch; keep waiting.
    SaveDataNotify = -(ERROR_BASE + 16), "SAVE_DATA_NOTIFY";
    /// The receive direction of an exchange is complete.
    RecvFinished = -(ERROR_BASE + 17), "RECV_FINISHED";
    /// Feature not supported.
    NotSupport = -(ERROR_BASE + 18), "NOT_SUPPORT";
    /// Message type or payload unexpected.
    InvalidMessage = -(ERROR_BASE + 19), "INVALID_MESSAGE";
    /// A system call failed.
    SystemApiFail = -(ERROR_BASE + 20), "SYSTEM_API_FAIL";
}

impl SyncCode {
    /// Returns true for [`SyncCode::Ok`].
    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }

    /// Returns true for negative codes.
    pub fn is_error(self) -> bool {
        self.code() < 0
    }
}

impl Default for SyncCode {
    fn default() -> Self {
        Self::Ok
    }
}

impl fmt::Display for SyncCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn codes_roundtrip() {
        for code in [
            SyncCode::Ok,
            SyncCode::SendFinished,
            SyncCode::VersionNotSupport,
            SyncCode::SecurityOptionCheckError,
            SyncCode::SystemApiFail,
        ] {
            assert_eq!(SyncCode::from_code(code.code()), code);
        }
    }

    #[test]
    fn unknown_code_is_preserved() {
        let code = SyncCode::from_code(-4242);
        assert_eq!(code, SyncCode::Other(-4242));
        assert_eq!(code.code(), -4242);
        assert_eq!(code.name(), "UNKNOWN");
    }

    #[test]
    fn signal_codes_are_not_errors() {
        assert!(!SyncCode::LocalWaterMarkNotInit.is_error());
        assert!(!SyncCode::WaterMarkInvalid.is_error());
        assert!(SyncCode::Busy.is_error());
        assert_eq!(SyncCode::LocalWaterMarkNotInit.code(), 0xaa);
    }

    #[test]
    fn display_shows_name_and_value() {
        assert_eq!(SyncCode::NotPermit.to_string(), "NOT_PERMIT(-1008)");
    }

    proptest! {
        #[test]
        fn every_wire_value_maps_back(value in any::<i32>()) {
            prop_assert_eq!(SyncCode::from_code(value).code(), value);
        }
    }
}
