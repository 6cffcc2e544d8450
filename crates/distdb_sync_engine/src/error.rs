//! Error types for the sync engine.

use distdb_codec::CodecError;
use distdb_storage::StorageError;
use distdb_sync_protocol::SyncCode;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Wire data could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The local store rejected the operation.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// The peer speaks a protocol version this build cannot handle.
    #[error("protocol version {version} not supported")]
    VersionNotSupported {
        /// Version reported by or assumed for the peer.
        version: u32,
    },

    /// Capabilities must be renegotiated before data can flow.
    #[error("ability sync required")]
    NeedAbilitySync,

    /// The access policy refused the exchange.
    #[error("permission check failed")]
    NotPermit,

    /// Security labels of the two devices do not allow the transfer.
    #[error("security option check failed")]
    SecurityOptionCheck,

    /// The peer answered with an error code.
    #[error("peer reported {code}")]
    Remote {
        /// Code carried by the peer's packet.
        code: SyncCode,
    },

    /// A message did not fit the current exchange.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Invalid state transition.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// The exchange timed out.
    #[error("operation timed out")]
    Timeout,

    /// Sync was cancelled.
    #[error("sync cancelled")]
    Cancelled,
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates an invalid message error.
    pub fn invalid_message(message: impl Into<String>) -> Self {
        Self::InvalidMessage(message.into())
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Storage(err) => err.is_transient(),
            SyncError::Timeout => true,
            SyncError::Remote { code } => matches!(code, SyncCode::Busy | SyncCode::KeyRevoked),
            _ => false,
        }
    }

    /// Wire code reported to the peer for this failure.
    pub fn code(&self) -> SyncCode {
        match self {
            SyncError::Transport { .. } => SyncCode::SystemApiFail,
            SyncError::Codec(err) => match err {
                CodecError::VersionNotSupported { .. } => SyncCode::VersionNotSupport,
                CodecError::LengthOverflow { .. } | CodecError::LengthMismatch { .. } => {
                    SyncCode::LengthError
                }
                CodecError::BatchTooLarge { .. } => SyncCode::OutOfMemory,
                _ => SyncCode::ParseError,
            },
            SyncError::Storage(err) => err.code(),
            SyncError::VersionNotSupported { .. } => SyncCode::VersionNotSupport,
            SyncError::NeedAbilitySync => SyncCode::NeedAbilitySync,
            SyncError::NotPermit => SyncCode::NotPermit,
            SyncError::SecurityOptionCheck => SyncCode::SecurityOptionCheckError,
            SyncError::Remote { code } => *code,
            SyncError::InvalidMessage(_) => SyncCode::InvalidMessage,
            SyncError::InvalidStateTransition { .. } => SyncCode::InternalError,
            SyncError::Timeout => SyncCode::Timeout,
            SyncError::Cancelled => SyncCode::InternalError,
        }
    }

    /// Maps a code received from the peer back into an error.
    pub fn from_remote(code: SyncCode) -> Self {
        match code {
            SyncCode::VersionNotSupport => Self::VersionNotSupported { version: 0 },
            SyncCode::NeedAbilitySync => Self::NeedAbilitySync,
            SyncCode::NotPermit => Self::NotPermit,
            SyncCode::SecurityOptionCheckError => Self::SecurityOptionCheck,
            other => Self::Remote { code: other },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::transport_retryable("connection lost").is_retryable());
        assert!(!SyncError::transport_fatal("peer offline").is_retryable());
        assert!(SyncError::Timeout.is_retryable());
        assert!(SyncError::from(StorageError::KeyRevoked).is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
        assert!(!SyncError::NotPermit.is_retryable());
    }

    #[test]
    fn codes() {
        assert_eq!(
            SyncError::from(CodecError::EmptyBuffer).code(),
            SyncCode::ParseError
        );
        assert_eq!(
            SyncError::from(CodecError::LengthMismatch {
                expected: 8,
                actual: 16
            })
            .code(),
            SyncCode::LengthError
        );
        assert_eq!(
            SyncError::from(StorageError::busy("migrating")).code(),
            SyncCode::Busy
        );
        assert_eq!(SyncError::SecurityOptionCheck.code(), SyncCode::SecurityOptionCheckError);
    }

    #[test]
    fn remote_codes_round_trip() {
        for code in [
            SyncCode::NotPermit,
            SyncCode::NeedAbilitySync,
            SyncCode::SecurityOptionCheckError,
            SyncCode::Busy,
        ] {
            assert_eq!(SyncError::from_remote(code).code(), code);
        }
    }

    #[test]
    fn error_display() {
        let err = SyncError::VersionNotSupported { version: 200 };
        assert!(err.to_string().contains("200"));
        let err = SyncError::Remote {
            code: SyncCode::NotFound,
        };
        assert!(err.to_string().contains("NOT_FOUND"));
    }
}
