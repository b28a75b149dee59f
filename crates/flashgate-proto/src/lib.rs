//! Wire format for the flashgate protocol.
//!
//! Two layers live here, deliberately independent of any I/O:
//!
//! - [`frame`]: a zero-insertion byte-stuffing codec that delimits
//!   variable-length frames on a raw byte stream. A fresh listener can
//!   resynchronize after at most one partial frame.
//! - [`Envelope`]: the CBOR-serialized message carried inside one frame:
//!   session id, request/response correlation id, and a closed payload
//!   union.
//!
//! The transport layer moves frames; the messenger translates between
//! packets and envelopes; neither needs anything else from this crate.

pub mod errors;
pub mod frame;
pub mod payloads;

mod envelope;

pub use envelope::{Envelope, ExchangeId, PayloadKind};
pub use errors::{ProtocolError, Result};
pub use frame::{FrameDecoder, FrameEncoder, MAX_PACKET_LEN, MAX_SLICE_LEN, encode_frame};
pub use payloads::Payload;
