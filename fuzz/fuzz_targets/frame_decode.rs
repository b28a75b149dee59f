//! Fuzz target for the push-style frame decoder.
//!
//! Arbitrary stream bytes must never panic the decoder: corrupt input is
//! dropped and the decoder resynchronizes on the next boundary.

#![no_main]

use flashgate_proto::FrameDecoder;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut decoder = FrameDecoder::new();
    // Feed in two chunks to exercise state carried across feeds.
    let split = data.len() / 2;
    let _ = decoder.feed(&data[..split]);
    let _ = decoder.feed(&data[split..]);
});
