//! Operation status values.
//!
//! A status carries a severity, a message and an optional call-tree dump.
//! Ok and Warning both count as success; only Error and Fatal are
//! failures. The common Ok-with-no-text case has a one-byte wire form.

use crate::{
    errors::{ProtocolError, Result},
    wire::{Reader, Writer},
};

/// Marker byte for the compact "Ok, no text" encoding.
const STATUS_OK_COMPACT: u8 = 0xFF;

/// Status severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum StatusKind {
    /// Success.
    #[default]
    Ok = 0,
    /// Success with a diagnostic message.
    Warning = 1,
    /// Failure.
    Error = 2,
    /// Unrecoverable failure (implementation bug or poisoned state).
    Fatal = 3,
}

impl StatusKind {
    fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            0 => Self::Ok,
            1 => Self::Warning,
            2 => Self::Error,
            3 => Self::Fatal,
            _ => return Err(ProtocolError::InvalidEncoding("status kind out of range")),
        })
    }
}

/// An operation outcome.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Status {
    /// Severity of the outcome.
    pub kind: StatusKind,
    /// Human-readable description; empty for plain success.
    pub message: String,
    /// Optional diagnostic call tree.
    pub call_tree: String,
}

impl Status {
    /// Plain success.
    pub fn ok() -> Self {
        Self::default()
    }

    /// Success with a diagnostic message.
    pub fn warning(message: impl Into<String>) -> Self {
        Self { kind: StatusKind::Warning, message: message.into(), call_tree: String::new() }
    }

    /// Failure.
    pub fn error(message: impl Into<String>) -> Self {
        Self { kind: StatusKind::Error, message: message.into(), call_tree: String::new() }
    }

    /// Unrecoverable failure.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self { kind: StatusKind::Fatal, message: message.into(), call_tree: String::new() }
    }

    /// Ok and Warning are both success.
    pub fn is_success(&self) -> bool {
        matches!(self.kind, StatusKind::Ok | StatusKind::Warning)
    }

    /// Serialize; plain Ok uses the one-byte compact form.
    pub fn encode(&self, w: &mut Writer<'_>) {
        if self.kind == StatusKind::Ok && self.message.is_empty() && self.call_tree.is_empty() {
            w.put_u8(STATUS_OK_COMPACT);
            return;
        }
        w.put_u8(self.kind as u8);
        w.put_string(&self.message);
        w.put_string(&self.call_tree);
    }

    /// Deserialize the wire form.
    pub fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let first = r.get_u8()?;
        if first == STATUS_OK_COMPACT {
            return Ok(Self::ok());
        }
        Ok(Self {
            kind: StatusKind::from_u8(first)?,
            message: r.get_string()?,
            call_tree: r.get_string()?,
        })
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            StatusKind::Ok => write!(f, "ok"),
            StatusKind::Warning => write!(f, "warning: {}", self.message),
            StatusKind::Error => write!(f, "error: {}", self.message),
            StatusKind::Fatal => write!(f, "fatal: {}", self.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::wire::ByteOrder;

    use super::*;

    #[test]
    fn ok_is_one_byte() {
        let mut buf = Vec::new();
        let mut w = Writer::new(&mut buf, ByteOrder::Big);
        Status::ok().encode(&mut w);
        assert_eq!(buf, vec![STATUS_OK_COMPACT]);

        let mut r = Reader::new(&buf, ByteOrder::Big);
        assert_eq!(Status::decode(&mut r).unwrap(), Status::ok());
    }

    #[test]
    fn error_round_trip() {
        let status = Status::error("channel not found");
        let mut buf = Vec::new();
        let mut w = Writer::new(&mut buf, ByteOrder::Little);
        status.encode(&mut w);

        let mut r = Reader::new(&buf, ByteOrder::Little);
        let back = Status::decode(&mut r).unwrap();
        assert_eq!(back, status);
        assert!(!back.is_success());
    }

    #[test]
    fn warning_counts_as_success() {
        assert!(Status::warning("field does not exist").is_success());
        assert!(!Status::fatal("bug").is_success());
    }
}
