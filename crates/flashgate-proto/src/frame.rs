//! Zero-insertion frame codec.
//!
//! Delimits variable-length binary frames on a raw byte stream so that a
//! listener joining mid-stream can always resynchronize. The encoded body of
//! a frame never contains a NUL byte; `0x00` appears on the wire only as the
//! frame boundary marker.
//!
//! # Wire format
//!
//! ```text
//! frame  := 0x00 slice* 0x00
//! slice  := lo hi payload
//! lo     := 0x80 | (len & 0x7F)
//! hi     := 0x80 | ((len >> 7) & 0x7F)
//! ```
//!
//! Payload bytes are never zero. A `0x00` in the input terminates the current
//! slice; the decoder reconstructs the zero between adjacent slices. The
//! final slice of a frame declares `len + 1` so that the closing boundary
//! byte lands inside its payload window, telling the decoder the frame is
//! complete.
//!
//! # Invariants
//!
//! - `decode(encode(B)) = B` for every `B` up to [`MAX_PACKET_LEN`] bytes.
//! - An encoded frame contains exactly two `0x00` bytes: the opening and the
//!   closing boundary.
//! - A decoder started at an arbitrary stream offset discards at most one
//!   partial frame before locking onto the next boundary.

use bytes::{BufMut, Bytes};

use crate::errors::{ProtocolError, Result};

/// Largest slice length the two-byte header can carry losslessly.
///
/// The header stores two 7-bit groups; bits above 14 do not survive the
/// round trip.
pub const MAX_SLICE_LEN: usize = 0x3FFF;

/// Largest packet a single frame can carry.
///
/// One less than [`MAX_SLICE_LEN`] because a frame whose payload has no
/// zeros is emitted as a single closing slice declaring `len + 1`.
pub const MAX_PACKET_LEN: usize = MAX_SLICE_LEN - 1;

/// Streaming frame encoder.
///
/// Accumulates non-zero payload bytes into a slice buffer and flushes a
/// slice whenever a zero is written or the frame is finished. Output goes to
/// any [`BufMut`].
#[derive(Debug, Default)]
pub struct FrameEncoder {
    slice: Vec<u8>,
}

impl FrameEncoder {
    /// Create an encoder with an empty slice buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a frame: emit the leading boundary marker.
    pub fn start_frame(&mut self, dst: &mut impl BufMut) {
        self.slice.clear();
        dst.put_u8(0x00);
    }

    /// Append one payload byte.
    ///
    /// A zero byte flushes the current slice; the decoder restores the zero
    /// between this slice and the next.
    pub fn write_byte(&mut self, byte: u8, dst: &mut impl BufMut) {
        if byte != 0 {
            self.slice.push(byte);
        } else {
            self.flush_slice(false, dst);
        }
    }

    /// Emit the two-byte slice-length header.
    ///
    /// Both bytes have the high bit set, so neither can be mistaken for a
    /// frame boundary.
    pub fn write_slice_size(&mut self, len: usize, dst: &mut impl BufMut) {
        debug_assert!(len <= MAX_SLICE_LEN);

        let lo = 0x80 | (len & 0x7F) as u8;
        let hi = 0x80 | ((len >> 7) & 0x7F) as u8;
        dst.put_u8(lo);
        dst.put_u8(hi);
    }

    /// Close the frame: flush the trailing slice (if any) and emit the
    /// closing boundary marker.
    pub fn finish_frame(&mut self, dst: &mut impl BufMut) {
        if !self.slice.is_empty() {
            self.flush_slice(true, dst);
        }

        self.slice.clear();
        dst.put_u8(0x00);
    }

    fn flush_slice(&mut self, eof: bool, dst: &mut impl BufMut) {
        self.write_slice_size(self.slice.len() + usize::from(eof), dst);
        dst.put_slice(&self.slice);
        self.slice.clear();
    }
}

/// Encode one packet as a complete frame.
///
/// # Errors
///
/// - [`ProtocolError::PacketTooLarge`] if the packet exceeds
///   [`MAX_PACKET_LEN`]; a zero-free run that long cannot be split across
///   slices without the decoder inserting a phantom zero.
pub fn encode_frame(packet: &[u8], dst: &mut impl BufMut) -> Result<()> {
    if packet.len() > MAX_PACKET_LEN {
        return Err(ProtocolError::PacketTooLarge { len: packet.len(), max: MAX_PACKET_LEN });
    }

    let mut encoder = FrameEncoder::new();
    encoder.start_frame(dst);
    for &byte in packet {
        encoder.write_byte(byte, dst);
    }
    encoder.finish_frame(dst);

    Ok(())
}

/// Decoder state between fed bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    /// Discarding a partial frame; waiting for the next boundary.
    Sync,
    /// At a boundary; skipping padding zeros until the first slice header.
    Idle,
    /// Read the low length byte; waiting for the high byte.
    SliceHi {
        /// Low length byte, high bit still set.
        lo: u8,
    },
    /// Reading slice payload.
    Payload {
        /// Declared payload bytes still outstanding.
        remaining: usize,
    },
    /// Slice payload consumed; the next byte closes the frame or opens the
    /// next slice.
    SliceEnd,
}

/// Incremental push-style frame decoder.
///
/// Feed it raw stream chunks as they arrive; completed frames come back in
/// order. Corrupt input (a length byte with the high bit clear, or a
/// boundary inside a slice header) drops the frame under construction and
/// resynchronizes on the next `0x00`.
#[derive(Debug)]
pub struct FrameDecoder {
    state: DecodeState,
    frame: Vec<u8>,
    corrupt_frames: u64,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Create a decoder that first synchronizes on a frame boundary.
    #[must_use]
    pub fn new() -> Self {
        Self { state: DecodeState::Sync, frame: Vec::new(), corrupt_frames: 0 }
    }

    /// Number of frames dropped due to stream corruption.
    #[must_use]
    pub fn corrupt_frames(&self) -> u64 {
        self.corrupt_frames
    }

    /// Feed a chunk of stream bytes; returns the frames completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        let mut frames = Vec::new();
        for &byte in chunk {
            if let Some(frame) = self.feed_byte(byte) {
                frames.push(frame);
            }
        }
        frames
    }

    fn feed_byte(&mut self, byte: u8) -> Option<Bytes> {
        match self.state {
            DecodeState::Sync => {
                if byte == 0 {
                    self.state = DecodeState::Idle;
                }
                None
            },

            DecodeState::Idle => {
                if byte == 0 {
                    // Tolerate repeated boundaries between frames.
                    return None;
                }
                self.state = self.begin_slice(byte);
                None
            },

            DecodeState::SliceHi { lo } => {
                if byte == 0 {
                    // Boundary inside a slice header: drop and start over
                    // from this boundary.
                    self.discard(DecodeState::Idle);
                    return None;
                }
                if byte & 0x80 == 0 {
                    self.discard(DecodeState::Sync);
                    return None;
                }

                let len = usize::from(lo & 0x7F) | (usize::from(byte & 0x7F) << 7);
                self.state = if len == 0 {
                    DecodeState::SliceEnd
                } else {
                    DecodeState::Payload { remaining: len }
                };
                None
            },

            DecodeState::Payload { remaining } => {
                if byte == 0 {
                    // The closing slice declares one byte more than it
                    // carries; hitting the boundary completes the frame.
                    return Some(self.complete());
                }

                self.frame.push(byte);
                self.state = match remaining - 1 {
                    0 => DecodeState::SliceEnd,
                    remaining => DecodeState::Payload { remaining },
                };
                None
            },

            DecodeState::SliceEnd => {
                // A slice flushed on a zero in the source; restore it.
                self.frame.push(0x00);

                if byte == 0 {
                    return Some(self.complete());
                }
                self.state = self.begin_slice(byte);
                None
            },
        }
    }

    /// Classify the first byte of a slice header.
    fn begin_slice(&mut self, byte: u8) -> DecodeState {
        debug_assert_ne!(byte, 0);
        if byte & 0x80 == 0 {
            self.corrupt_frames += 1;
            self.frame.clear();
            DecodeState::Sync
        } else {
            DecodeState::SliceHi { lo: byte }
        }
    }

    fn discard(&mut self, next: DecodeState) {
        self.corrupt_frames += 1;
        self.frame.clear();
        self.state = next;
    }

    fn complete(&mut self) -> Bytes {
        self.state = DecodeState::Idle;
        Bytes::from(std::mem::take(&mut self.frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slice_size(len: usize) -> Vec<u8> {
        let mut out = Vec::new();
        FrameEncoder::new().write_slice_size(len, &mut out);
        out
    }

    fn encode(packet: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        encode_frame(packet, &mut out).unwrap();
        out
    }

    #[test]
    fn slice_size_encoding() {
        assert_eq!(slice_size(0), [0x80, 0x80]);
        assert_eq!(slice_size(10), [0x8A, 0x80]);
        assert_eq!(slice_size(127), [0xFF, 0x80]);
        assert_eq!(slice_size(128), [0x80, 0x81]);
        assert_eq!(slice_size(129), [0x81, 0x81]);
        assert_eq!(slice_size(256), [0x80, 0x82]);
        assert_eq!(slice_size(512), [0x80, 0x84]);
        assert_eq!(slice_size(1024), [0x80, 0x88]);
    }

    #[test]
    fn encode_without_zeros() {
        assert_eq!(encode(&[0x1, 0x2, 0x3, 0x4]), [0x00, 0x85, 0x80, 0x1, 0x2, 0x3, 0x4, 0x00]);

        let long = vec![0x1A; 256];
        let mut expected = vec![0x00, 0x81, 0x82];
        expected.extend_from_slice(&long);
        expected.push(0x00);
        assert_eq!(encode(&long), expected);
    }

    #[test]
    fn encode_with_zeros() {
        assert_eq!(encode(&[0x0]), [0x00, 0x80, 0x80, 0x00]);
        assert_eq!(encode(&[0x1, 0x0]), [0x00, 0x81, 0x80, 0x1, 0x00]);
        assert_eq!(encode(&[0x1, 0x0, 0x1]), [0x00, 0x81, 0x80, 0x1, 0x82, 0x80, 0x1, 0x00]);
        assert_eq!(encode(&[0x1, 0x0, 0x1, 0x0]), [0x00, 0x81, 0x80, 0x1, 0x81, 0x80, 0x1, 0x00]);
    }

    #[test]
    fn boundary_bytes_only_at_frame_edges() {
        let body = [0x1, 0x0, 0x2, 0x0, 0x0, 0x3];
        let wire = encode(&body);
        let zeros: Vec<usize> =
            wire.iter().enumerate().filter(|(_, b)| **b == 0).map(|(i, _)| i).collect();
        assert_eq!(zeros, [0, wire.len() - 1]);
    }

    #[test]
    fn reject_oversized_packet() {
        let packet = vec![0x1; MAX_PACKET_LEN + 1];
        let mut out = Vec::new();
        assert_eq!(
            encode_frame(&packet, &mut out),
            Err(ProtocolError::PacketTooLarge { len: MAX_PACKET_LEN + 1, max: MAX_PACKET_LEN })
        );
    }

    #[test]
    fn decode_single_frames() {
        let cases: &[(&[u8], &[u8])] = &[
            (&[0x00, 0x82, 0x80, 0x1, 0x00], &[0x1]),
            (&[0x00, 0x83, 0x80, 0x1, 0x2, 0x00], &[0x1, 0x2]),
            (&[0x00, 0x81, 0x80, 0x1, 0x00], &[0x1, 0x0]),
            (&[0x00, 0x80, 0x80, 0x00], &[0x0]),
            (&[0x00, 0x81, 0x80, 0x1, 0x82, 0x80, 0x1, 0x00], &[0x1, 0x0, 0x1]),
        ];

        for (wire, expected) in cases {
            let mut decoder = FrameDecoder::new();
            let frames = decoder.feed(wire);
            assert_eq!(frames.len(), 1, "wire {wire:02X?}");
            assert_eq!(frames[0].as_ref(), *expected);
        }
    }

    #[test]
    fn rubbish_without_boundary_yields_nothing() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.feed(&[0xFF, 0xF1, 0x2F, 0x3F]).is_empty());
        assert!(decoder.feed(&[]).is_empty());
    }

    #[test]
    fn bare_boundaries_yield_nothing() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.feed(&[0x00, 0x00, 0x00]).is_empty());
        assert_eq!(decoder.corrupt_frames(), 0);
    }

    #[test]
    fn clear_high_bit_drops_frame_and_resyncs() {
        let mut decoder = FrameDecoder::new();
        // 0x7F cannot start a slice header; everything up to the next
        // boundary is discarded, then a valid frame decodes.
        let mut wire = vec![0x00, 0x7F, 0x12, 0x34];
        wire.extend_from_slice(&encode(b"ok"));
        let frames = decoder.feed(&wire);

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_ref(), b"ok");
        assert_eq!(decoder.corrupt_frames(), 1);
    }

    #[test]
    fn boundary_inside_header_restarts_at_boundary() {
        let mut decoder = FrameDecoder::new();
        // Slice header truncated by a boundary; the frame after it decodes.
        let mut wire = vec![0x00, 0x85];
        wire.extend_from_slice(&encode(&[0x9]));
        let frames = decoder.feed(&wire);

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_ref(), [0x9]);
        assert_eq!(decoder.corrupt_frames(), 1);
    }

    #[test]
    fn byte_at_a_time_matches_chunked() {
        let body = [0x1, 0x0, 0x2, 0x3, 0x0];
        let wire = encode(&body);

        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        for byte in wire {
            frames.extend(decoder.feed(&[byte]));
        }

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_ref(), body);
    }

    #[test]
    fn back_to_back_frames() {
        let mut wire = encode(b"first");
        wire.extend_from_slice(&encode(b"second"));

        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(&wire);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].as_ref(), b"first");
        assert_eq!(frames[1].as_ref(), b"second");
    }
}
