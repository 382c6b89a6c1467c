//! Client-side error types.

use pva_proto::{ProtocolError, Status};
use thiserror::Error;

/// Errors surfaced to users of the client runtime.
#[derive(Error, Debug, Clone)]
pub enum ClientError {
    /// The channel's transport dropped; the operation survives and will
    /// re-initialize on reconnect.
    #[error("disconnected")]
    Disconnected,

    /// The peer stopped answering echo heartbeats.
    #[error("transport unresponsive")]
    Unresponsive,

    /// The operation or its channel was destroyed.
    #[error("cancelled")]
    Cancelled,

    /// A second method call was issued before the previous one finished.
    #[error("a request is already in flight on this operation")]
    AlreadyInFlight,

    /// The operation handle was used before (or after) its valid states.
    #[error("operation destroyed")]
    Destroyed,

    /// The server reported a failure status.
    #[error("server error: {0}")]
    Server(Status),

    /// The connection validation handshake failed.
    #[error("connection rejected: {0}")]
    AuthRejected(Status),

    /// A wire-level protocol violation (fatal to the connection).
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Socket-level failure.
    #[error("i/o error: {0}")]
    Io(String),

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl ClientError {
    /// Map a server status into `Ok` or [`ClientError::Server`].
    pub fn check(status: Status) -> Result<Status, ClientError> {
        if status.is_success() { Ok(status) } else { Err(ClientError::Server(status)) }
    }
}
