//! Debugger bridge payload types.
//!
//! Debug sessions have their own identifier space, minted by the gateway
//! when a session starts; it is unrelated to the envelope's session id.

use serde::{Deserialize, Serialize};

/// Open a debug session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebuggerStart {
    /// Target board configuration name.
    pub target: String,
    /// Firmware image to load symbols from.
    pub firmware: String,
}

/// Successful start: the handle for subsequent debugger traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebuggerStarted {
    /// Gateway-assigned debug session id.
    pub session_id: u64,
}

/// Close a debug session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebuggerStop {
    /// Session to close.
    pub session_id: u64,
}

/// One line of debugger console traffic.
///
/// Peer → gateway: a command for the debugger's stdin. Gateway → peer:
/// an output line, with `ordinal` increasing per session so the peer can
/// detect gaps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebuggerLine {
    /// Debug session this line belongs to.
    pub session_id: u64,
    /// Per-session sequence number of the line.
    pub ordinal: u64,
    /// Line content without the trailing newline.
    pub line: String,
}
