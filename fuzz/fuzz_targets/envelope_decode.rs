//! Fuzz target for envelope deserialization.
//!
//! Arbitrary packet bytes must decode to an envelope or a clean error,
//! never a panic.

#![no_main]

use flashgate_proto::Envelope;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(envelope) = Envelope::decode(data) {
        // Whatever decodes must re-encode.
        let _ = envelope.to_bytes();
    }
});
