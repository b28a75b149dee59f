//! Fuzz target for frame encode/decode round-trip identity.

#![no_main]

use flashgate_proto::{FrameDecoder, MAX_PACKET_LEN, encode_frame};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if data.len() > MAX_PACKET_LEN {
        return;
    }

    let mut wire = Vec::new();
    encode_frame(data, &mut wire).expect("size checked above");

    let mut decoder = FrameDecoder::new();
    let frames = decoder.feed(&wire);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].as_ref(), data);
    assert_eq!(decoder.corrupt_frames(), 0);
});
