//! Error types for the codec crate.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors that can occur while encoding or decoding wire structures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The parcel was built over an empty buffer.
    #[error("parcel buffer is empty")]
    EmptyBuffer,

    /// A previous operation on the parcel failed.
    #[error("parcel is poisoned by an earlier failure")]
    Poisoned,

    /// Not enough room left in the buffer for a write.
    #[error("out of space: need {needed} bytes, {remaining} remaining")]
    OutOfSpace {
        /// Bytes the write needed.
        needed: usize,
        /// Bytes left in the buffer.
        remaining: usize,
    },

    /// Unexpected end of input while reading.
    #[error("unexpected end of input: need {needed} bytes, {remaining} remaining")]
    UnexpectedEof {
        /// Bytes the read needed.
        needed: usize,
        /// Bytes left in the buffer.
        remaining: usize,
    },

    /// A computed or decoded length exceeds `i32::MAX`.
    #[error("length {len} exceeds the maximum encodable length")]
    LengthOverflow {
        /// The offending length.
        len: u64,
    },

    /// Invalid UTF-8 string.
    #[error("invalid UTF-8 string")]
    InvalidUtf8,

    /// The protocol version is outside the supported range.
    #[error("protocol version {version} is not supported")]
    VersionNotSupported {
        /// The rejected version.
        version: u32,
    },

    /// A decoded batch claims more entries than allowed.
    #[error("batch of {claimed} entries exceeds the limit of {max}")]
    BatchTooLarge {
        /// Entry count read from the wire.
        claimed: u64,
        /// Maximum accepted entry count.
        max: u64,
    },

    /// The consumed length disagrees with the buffer length.
    #[error("length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch {
        /// Expected byte length.
        expected: usize,
        /// Actual byte length.
        actual: usize,
    },

    /// Failed to decode a wire structure.
    #[error("decoding failed: {message}")]
    DecodingFailed {
        /// Description of the decoding error.
        message: String,
    },
}

impl CodecError {
    /// Create a decoding failed error.
    pub fn decoding_failed(message: impl Into<String>) -> Self {
        Self::DecodingFailed {
            message: message.into(),
        }
    }

    /// Create a version error.
    pub fn version_not_supported(version: u32) -> Self {
        Self::VersionNotSupported { version }
    }

    /// Returns true if the error came from malformed or truncated input.
    pub fn is_parse_failure(&self) -> bool {
        !matches!(self, Self::VersionNotSupported { .. } | Self::OutOfSpace { .. })
    }
}
