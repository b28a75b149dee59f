//! Protocol error types.

use thiserror::Error;

/// Result alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors produced by the wire layer.
///
/// Codec-level corruption (bad slice headers, truncated slices) is not
/// represented here: the frame decoder recovers from it in place by
/// resynchronizing on the next boundary and counting the dropped frame.
/// `ProtocolError` covers the failures a caller must act on.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Packet exceeds what a single frame can carry.
    ///
    /// The slice-length header holds two 7-bit groups, so the largest
    /// lossless slice is `0x3FFF` bytes and the largest packet one byte
    /// less (the closing slice encodes `len + 1`).
    #[error("packet too large: {len} bytes (max {max})")]
    PacketTooLarge {
        /// Size of the rejected packet.
        len: usize,
        /// Maximum encodable packet size.
        max: usize,
    },

    /// Envelope serialization failed.
    #[error("envelope encode failed: {0}")]
    Encode(String),

    /// Envelope deserialization failed.
    ///
    /// Receivers drop the packet and log; a peer speaking a newer schema
    /// must not take the session down.
    #[error("envelope decode failed: {0}")]
    Decode(String),
}
