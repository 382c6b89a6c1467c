//! Server-side error types.

use pva_proto::ProtocolError;
use thiserror::Error;

/// Errors surfaced by the server runtime.
#[derive(Error, Debug)]
pub enum ServerError {
    /// A wire-level protocol violation; fatal to the offending
    /// connection.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Socket-level failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Bad runtime configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}
