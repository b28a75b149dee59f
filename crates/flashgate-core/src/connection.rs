//! Connection lifecycle model shared by every layer.
//!
//! # State machine
//!
//! ```text
//!               reconnect()                   disconnect()
//! Disconnected ───────────> Connecting ──┐  Connected ──> Disconnecting ──> Disconnected
//!      ^                        │        │
//!      │        hangup          │ dial   └──> Connected
//!      └──── (EOF from peer)    │ failed
//!                               └───────────> Error
//! ```
//!
//! `reconnect()` always passes through `Connecting` before `Connected` or
//! `Error`; `disconnect()` always passes through `Disconnecting`. Successive
//! identical states are suppressed at every layer boundary, so observers see
//! each distinct value exactly once.

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No pipe; the initial state.
    Disconnected,
    /// A dial attempt is in progress.
    Connecting,
    /// Pipe established; traffic flows.
    Connected,
    /// An orderly teardown is in progress.
    Disconnecting,
    /// The pipe failed; the retry machinery decides what happens next.
    Error,
}

impl ConnectionState {
    /// Whether traffic can flow right now.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Same-state suppression at a layer boundary.
///
/// Each layer runs its observed states through a gate before notifying the
/// layer above, so duplicate notifications never propagate.
#[derive(Debug, Default)]
pub struct StateGate {
    last: Option<ConnectionState>,
}

impl StateGate {
    /// Admit `state` if it differs from the previously admitted one.
    pub fn admit(&mut self, state: ConnectionState) -> bool {
        if self.last == Some(state) {
            return false;
        }
        self.last = Some(state);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_suppresses_duplicates() {
        let mut gate = StateGate::default();
        assert!(gate.admit(ConnectionState::Connecting));
        assert!(gate.admit(ConnectionState::Connected));
        assert!(!gate.admit(ConnectionState::Connected));
        assert!(gate.admit(ConnectionState::Disconnected));
        assert!(gate.admit(ConnectionState::Connected));
    }
}
