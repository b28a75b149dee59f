//! Envelope: the structured message carried inside one frame.
//!
//! Every packet on the wire is exactly one CBOR-serialized [`Envelope`]. The
//! envelope carries the session id that tags the conversation, at most one
//! correlation id (request or response), and at most one payload arm.
//!
//! The session layer enforces the semantic invariants (an envelope it mints
//! always has an id and a payload; inbound envelopes missing either are
//! dropped with a warning), so the data model here stays permissive enough
//! to decode whatever a peer sends.

use bytes::{BufMut, Bytes};
use serde::{Deserialize, Serialize};

use crate::{
    Payload,
    errors::{ProtocolError, Result},
};

/// Correlation id: exactly one of request or response per carrier message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExchangeId {
    /// Locally minted id awaiting a matching response.
    Request(u64),
    /// Echo of the request id this message answers.
    Response(u64),
}

impl ExchangeId {
    /// The raw correlation value, whichever direction it travels.
    #[must_use]
    pub const fn value(self) -> u64 {
        match self {
            Self::Request(id) | Self::Response(id) => id,
        }
    }
}

/// One structured protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Session this message belongs to; `0` while unassigned.
    pub session_id: u64,
    /// Correlation id, when the message takes part in an exchange.
    pub id: Option<ExchangeId>,
    /// Message content.
    pub payload: Option<Payload>,
}

impl Envelope {
    /// Build a request envelope.
    #[must_use]
    pub fn request(session_id: u64, request_id: u64, payload: Payload) -> Self {
        Self { session_id, id: Some(ExchangeId::Request(request_id)), payload: Some(payload) }
    }

    /// Build a response envelope answering `request_id`.
    #[must_use]
    pub fn response(session_id: u64, request_id: u64, payload: Payload) -> Self {
        Self { session_id, id: Some(ExchangeId::Response(request_id)), payload: Some(payload) }
    }

    /// Dispatch tag of the payload, if one is present.
    #[must_use]
    pub fn kind(&self) -> Option<PayloadKind> {
        self.payload.as_ref().map(Payload::kind)
    }

    /// Serialize into a caller-provided buffer.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::Encode`] if CBOR serialization fails
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        ciborium::ser::into_writer(self, dst.writer())
            .map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Serialize into a fresh packet buffer.
    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = Vec::new();
        self.encode(&mut buf)?;
        Ok(Bytes::from(buf))
    }

    /// Deserialize from one packet's bytes.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::Decode`] if the bytes are not a valid envelope
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        ciborium::de::from_reader(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

/// Dispatch tag identifying a payload arm without its content.
///
/// The request router keys its handler table on the kind of the request arm
/// each handler serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadKind {
    /// Peer liveness probe.
    Heartbeat,
    /// Generic success acknowledgement.
    Ok,
    /// Peer-assigned session identifier.
    SetSessionId,
    /// Failure description.
    Error,
    /// Loopback diagnostics payload.
    Test,
    /// List board configurations.
    GetBoardsRequest,
    /// Board catalog.
    GetBoardsResponse,
    /// Replace favourite boards.
    PutBoardsRequest,
    /// Favourite boards outcome.
    PutBoardsResponse,
    /// List firmware images.
    GetFirmwareRequest,
    /// Firmware catalog.
    GetFirmwareResponse,
    /// Replace favourite firmware.
    PutFirmwareRequest,
    /// Favourite firmware outcome.
    PutFirmwareResponse,
    /// Chunked upload event.
    FileUpload,
    /// Remove an uploaded file.
    DeleteFile,
    /// Program a board.
    FlashRequest,
    /// Flash outcome.
    FlashResponse,
    /// Device status push.
    DeviceUpdateStatus,
    /// Open a debug session.
    DebuggerStart,
    /// Debug session handle.
    DebuggerStarted,
    /// Close a debug session.
    DebuggerStop,
    /// Debugger console line.
    DebuggerLine,
}

impl std::fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}
