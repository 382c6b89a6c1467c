//! Error types for the wire layer.
//!
//! Protocol errors are fatal to the connection they occur on; request
//! errors (`InvalidRequest`) are reported back through the offending
//! operation and are recoverable.

use thiserror::Error;

/// Convenience alias used throughout the wire layer.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors raised while encoding or decoding protocol messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// First byte of a frame was not the protocol magic.
    #[error("bad magic: expected 0xCA, got {0:#04x}")]
    BadMagic(u8),

    /// Peer speaks a protocol revision below the minimum we support.
    #[error("unsupported protocol revision {actual} (minimum {minimum})")]
    BadVersion {
        /// Revision advertised by the peer.
        actual: u8,
        /// Oldest revision this implementation accepts.
        minimum: u8,
    },

    /// Header claims more payload than the buffer holds.
    #[error("short frame: payload of {expected} bytes, {actual} available")]
    ShortFrame {
        /// Bytes the header claims.
        expected: usize,
        /// Bytes actually buffered.
        actual: usize,
    },

    /// An ONLY_ID introspection reference was never registered.
    #[error("unknown introspection type id {0}")]
    UnknownTypeId(u16),

    /// Alignment padding could not be satisfied or was non-zero on a
    /// boundary that the decoder validates.
    #[error("unaligned data at offset {offset} (alignment {alignment})")]
    UnalignedData {
        /// Cursor offset where alignment failed.
        offset: usize,
        /// Required alignment in bytes.
        alignment: usize,
    },

    /// Ran out of buffered bytes mid-field.
    #[error("buffer exhausted: needed {needed} more bytes, {remaining} left")]
    BufferExhausted {
        /// Bytes the current field still requires.
        needed: usize,
        /// Bytes remaining in the buffer.
        remaining: usize,
    },

    /// A size/selector byte had no valid interpretation.
    #[error("invalid encoding: {0}")]
    InvalidEncoding(&'static str),

    /// Unknown type code in a full introspection encoding.
    #[error("invalid type code {0:#04x}")]
    InvalidTypeCode(u8),

    /// A string field held invalid UTF-8.
    #[error("invalid utf-8 in string field")]
    InvalidUtf8,

    /// A value did not match the descriptor it was (de)serialized against.
    #[error("type mismatch: expected {expected}")]
    TypeMismatch {
        /// Human-readable name of the expected shape.
        expected: &'static str,
    },

    /// A pvRequest selector failed to parse.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Segments of a chained message disagreed on command or byte order.
    #[error("segment mismatch: {0}")]
    SegmentMismatch(&'static str),
}

impl From<std::str::Utf8Error> for ProtocolError {
    fn from(_: std::str::Utf8Error) -> Self {
        Self::InvalidUtf8
    }
}

impl From<std::string::FromUtf8Error> for ProtocolError {
    fn from(_: std::string::FromUtf8Error) -> Self {
        Self::InvalidUtf8
    }
}
