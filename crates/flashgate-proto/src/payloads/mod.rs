//! CBOR-encoded envelope payloads.
//!
//! Frames carry one serialized [`Envelope`](crate::Envelope) whose payload is
//! a closed tagged union: control arms the session layer answers internally
//! (heartbeat, ok, session-id assignment, error) and application arms the
//! request router dispatches to handlers (catalog, upload, flash, debugger).
//!
//! CBOR keeps the schema self-describing without code generation; unknown or
//! malformed payloads fail decoding at the messenger and are dropped there.

pub mod boards;
pub mod debugger;
pub mod device;
pub mod firmware;
pub mod upload;

use serde::{Deserialize, Serialize};

use crate::PayloadKind;

/// Error payload carried in an error response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Human-readable failure description.
    pub description: String,
}

impl ErrorInfo {
    /// Build an error payload from any displayable failure.
    pub fn new(description: impl Into<String>) -> Self {
        Self { description: description.into() }
    }
}

/// All possible envelope payloads.
///
/// Every variant maps to exactly one [`PayloadKind`]; the router keys its
/// handler table on the kind of the request arm it serves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    // Control, answered inside the session
    /// Peer liveness probe.
    Heartbeat,
    /// Generic success acknowledgement.
    Ok,
    /// Peer-assigned session identifier.
    SetSessionId(u64),
    /// Failure description for a rejected request.
    Error(ErrorInfo),
    /// Opaque test payload used by loopback diagnostics.
    Test(String),

    // Catalog
    /// List board configurations.
    GetBoardsRequest,
    /// Board configurations with favourites.
    GetBoardsResponse(boards::BoardsData),
    /// Replace the favourite boards set.
    PutBoardsRequest(boards::BoardsData),
    /// Outcome of a favourites update.
    PutBoardsResponse {
        /// Whether the update was applied.
        success: bool,
    },
    /// List firmware images.
    GetFirmwareRequest,
    /// Firmware images with favourites.
    GetFirmwareResponse(firmware::FirmwareData),
    /// Replace the favourite firmware set.
    PutFirmwareRequest(firmware::FirmwareData),
    /// Outcome of a favourites update.
    PutFirmwareResponse {
        /// Whether the update was applied.
        success: bool,
    },

    // Files
    /// Chunked firmware upload event.
    FileUpload(upload::FileUpload),
    /// Remove an uploaded file by name.
    DeleteFile {
        /// File name within the firmware directory.
        name: String,
    },

    // Flashing
    /// Program a firmware image onto a board.
    FlashRequest(device::FlashRequest),
    /// Programmer output for a completed flash.
    FlashResponse(device::FlashResponse),
    /// Gateway-initiated device status push.
    DeviceUpdateStatus(device::DeviceUpdateStatus),

    // Debugger
    /// Open a debug session against a target.
    DebuggerStart(debugger::DebuggerStart),
    /// Debug session handle for a successful start.
    DebuggerStarted(debugger::DebuggerStarted),
    /// Close a debug session.
    DebuggerStop(debugger::DebuggerStop),
    /// One line of debugger console traffic, either direction.
    DebuggerLine(debugger::DebuggerLine),
}

impl Payload {
    /// Dispatch tag of this payload.
    #[must_use]
    pub const fn kind(&self) -> PayloadKind {
        match self {
            Self::Heartbeat => PayloadKind::Heartbeat,
            Self::Ok => PayloadKind::Ok,
            Self::SetSessionId(_) => PayloadKind::SetSessionId,
            Self::Error(_) => PayloadKind::Error,
            Self::Test(_) => PayloadKind::Test,
            Self::GetBoardsRequest => PayloadKind::GetBoardsRequest,
            Self::GetBoardsResponse(_) => PayloadKind::GetBoardsResponse,
            Self::PutBoardsRequest(_) => PayloadKind::PutBoardsRequest,
            Self::PutBoardsResponse { .. } => PayloadKind::PutBoardsResponse,
            Self::GetFirmwareRequest => PayloadKind::GetFirmwareRequest,
            Self::GetFirmwareResponse(_) => PayloadKind::GetFirmwareResponse,
            Self::PutFirmwareRequest(_) => PayloadKind::PutFirmwareRequest,
            Self::PutFirmwareResponse { .. } => PayloadKind::PutFirmwareResponse,
            Self::FileUpload(_) => PayloadKind::FileUpload,
            Self::DeleteFile { .. } => PayloadKind::DeleteFile,
            Self::FlashRequest(_) => PayloadKind::FlashRequest,
            Self::FlashResponse(_) => PayloadKind::FlashResponse,
            Self::DeviceUpdateStatus(_) => PayloadKind::DeviceUpdateStatus,
            Self::DebuggerStart(_) => PayloadKind::DebuggerStart,
            Self::DebuggerStarted(_) => PayloadKind::DebuggerStarted,
            Self::DebuggerStop(_) => PayloadKind::DebuggerStop,
            Self::DebuggerLine(_) => PayloadKind::DebuggerLine,
        }
    }
}
