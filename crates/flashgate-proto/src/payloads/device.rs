//! Flashing and device status payload types.

use serde::{Deserialize, Serialize};

use super::{boards::Board, firmware::Firmware};

/// Ask the gateway to program a firmware image onto a board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashRequest {
    /// Target board configuration.
    pub board: Board,
    /// Image to program.
    pub firmware: Firmware,
}

/// Programmer output returned once flashing completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashResponse {
    /// Captured tool output, stderr included.
    pub message: String,
}

/// Gateway-initiated status push while a device operation runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceUpdateStatus {
    /// Current device state.
    pub status: DeviceState,
    /// Fraction complete while flashing, `0.0..=1.0`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flashing_progress: Option<f32>,
    /// Image being programmed, when one is active.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// Observable device states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceState {
    /// No device detected on the programming header.
    Unreachable,
    /// Device present and idle.
    Ready,
    /// Flash operation in progress.
    Flashing,
    /// Last operation failed.
    Error,
}
