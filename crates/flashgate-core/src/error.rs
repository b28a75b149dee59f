//! Error types for the protocol stack.

use flashgate_proto::{PayloadKind, ProtocolError};
use thiserror::Error;

/// Errors surfaced by the transport layer.
///
/// Cloneable so the same terminal error can settle a packet future and be
/// logged; underlying `io::Error` values are flattened to strings for that
/// reason.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Read or write on the byte pipe failed.
    #[error("i/o failure: {0}")]
    Io(String),

    /// Dialing (or re-dialing) the pipe failed.
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// Delivery abandoned after exhausting the retry budget.
    #[error("delivery abandoned after {attempts} errors: {reason}")]
    RetriesExhausted {
        /// Error count at the moment the transport gave up.
        attempts: u32,
        /// Last underlying failure.
        reason: String,
    },

    /// Packet rejected by the wire layer before transmission.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The transport was torn down while the packet was outstanding.
    #[error("transport closed")]
    Closed,
}

/// Errors surfaced to request issuers by the session layer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    /// The request's packet could not be delivered.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The session was torn down with the request still pending.
    #[error("session closed")]
    Closed,
}

/// Errors produced by application handlers and the request router.
///
/// Whatever reaches the session from this type is serialized into an error
/// response for the peer, so messages should read well on the other side.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// No handler is registered for the request's payload kind.
    #[error("missing responder for {0}")]
    MissingResponder(PayloadKind),

    /// The request payload did not have the shape the handler expects.
    #[error("malformed request: {0}")]
    BadRequest(String),

    /// The handler accepted the request but failed to serve it.
    #[error("{0}")]
    Failed(String),

    /// A requester received a response with an unexpected payload kind.
    #[error("invalid response: expected {expected}, got {got}")]
    InvalidResponse {
        /// Payload kind the requester was waiting for.
        expected: PayloadKind,
        /// Payload kind that actually arrived (`None` for an empty payload).
        got: String,
    },

    /// The underlying session failed before a response arrived.
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl HandlerError {
    /// Wrap any displayable failure as a handler failure.
    pub fn failed(err: impl std::fmt::Display) -> Self {
        Self::Failed(err.to_string())
    }
}
