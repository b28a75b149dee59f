//! Protocol stack for the flashgate gateway.
//!
//! Turns a single point-to-point byte pipe into a reliable, session-oriented
//! request/response channel. Four layers compose bottom-up, each an actor
//! task owning the layer below:
//!
//! ```text
//!  Session    request/response correlation, heartbeat, session id
//!  Messenger  envelope encode/decode, state proxying
//!  Transport  send queue, reconnect/retry, frame I/O
//!  BytePipe   TCP socket, RFCOMM socket, in-memory duplex
//! ```
//!
//! Above the session sits the [`router::RequestRouter`], the seam where
//! application handlers plug in. [`connect_stack`] wires a full stack over
//! any [`pipe::PipeBuilder`].

pub mod actor;
pub mod connection;
pub mod error;
pub mod listener;
pub mod messenger;
pub mod pipe;
pub mod router;
pub mod session;
pub mod transport;

use std::sync::Arc;

pub use connection::{ConnectionState, StateGate};
pub use error::{HandlerError, SessionError, TransportError};
pub use router::{RequestRouter, Requester, Responder, send_request};
pub use session::{ResponseFuture, SessionClient, SessionConfig, SessionHandle};
pub use transport::TransportConfig;

/// Build a full protocol stack (transport, messenger, session) over a pipe,
/// with `client` as the application seam.
///
/// The returned handle is the stack's only owner: drop it (or call
/// [`SessionHandle::disconnect`]) to tear the stack down top-down.
pub fn connect_stack(
    builder: Box<dyn pipe::PipeBuilder>,
    client: Arc<dyn SessionClient>,
    transport_config: TransportConfig,
    session_config: SessionConfig,
) -> SessionHandle {
    let (transport, transport_events) = transport::spawn_transport(builder, transport_config);
    let (messenger, messenger_events) = messenger::spawn_messenger(transport, transport_events);
    session::spawn_session(messenger, messenger_events, client, session_config)
}
