//! Error types for storage operations.

use distdb_sync_protocol::SyncCode;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// An argument was out of range.
    #[error("invalid argument: {message}")]
    InvalidArgs {
        /// What was wrong.
        message: String,
    },

    /// The record does not exist.
    #[error("not found")]
    NotFound,

    /// The continue token does not belong to a live scan of this store.
    #[error("continue token is not valid for this store")]
    InvalidToken,

    /// The engine is migrating or attaching and cannot serve the request.
    #[error("storage busy: {state}")]
    Busy {
        /// Engine state at the time of the request.
        state: String,
    },

    /// Data is held in the cache generation until migration completes.
    #[error("storage key revoked: data is cached until migration completes")]
    KeyRevoked,

    /// The requested feature is not available.
    #[error("not supported: {what}")]
    NotSupport {
        /// The missing feature.
        what: String,
    },

    /// Internal invariant broken.
    #[error("internal storage error: {message}")]
    Internal {
        /// Description of the failure.
        message: String,
    },
}

impl StorageError {
    /// Create an invalid argument error.
    pub fn invalid_args(message: impl Into<String>) -> Self {
        Self::InvalidArgs {
            message: message.into(),
        }
    }

    /// Create a busy error.
    pub fn busy(state: impl Into<String>) -> Self {
        Self::Busy {
            state: state.into(),
        }
    }

    /// Create a not supported error.
    pub fn not_support(what: impl Into<String>) -> Self {
        Self::NotSupport { what: what.into() }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if the caller should retry later.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Busy { .. } | Self::KeyRevoked)
    }

    /// Wire code reported to a peer.
    pub fn code(&self) -> SyncCode {
        match self {
            Self::InvalidArgs { .. } | Self::InvalidToken => SyncCode::InvalidArgs,
            Self::NotFound => SyncCode::NotFound,
            Self::Busy { .. } => SyncCode::Busy,
            Self::KeyRevoked => SyncCode::KeyRevoked,
            Self::NotSupport { .. } => SyncCode::NotSupport,
            Self::Internal { .. } => SyncCode::InternalError,
        }
    }
}
