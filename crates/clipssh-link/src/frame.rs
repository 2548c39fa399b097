//! Marker + COBS + CRC frame codec.
//!
//! Inner layout before COBS encoding:
//!
//! ```text
//! [type: u8][frame_seq: u32 BE][len: u16 BE][payload: len][crc32: u32 BE]
//! ```
//!
//! `crc32` is IEEE 802.3 over everything before it, so a flipped bit in the
//! type or frame_seq fields is caught the same way as one in the payload.
//! The COBS output is zero-free, so a run of `marker_run` zero bytes on
//! each side delimits frames unambiguously.

use crate::{FRAME_MAX_BYTES, LinkError};

const TYPE_DATA: u8 = 0x01;
const TYPE_ACK: u8 = 0x02;

/// Fixed bytes around the payload: type + frame_seq + len + crc32.
const INNER_OVERHEAD: usize = 1 + 4 + 2 + 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkFrame {
    Data { frame_seq: u32, payload: Vec<u8> },
    Ack { frame_seq: u32 },
}

impl LinkFrame {
    pub fn frame_seq(&self) -> u32 {
        match self {
            LinkFrame::Data { frame_seq, .. } | LinkFrame::Ack { frame_seq } => *frame_seq,
        }
    }
}

/// Stateless encoder for a fixed marker run length.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    marker_run: usize,
}

impl FrameCodec {
    pub fn new(marker_run: usize) -> FrameCodec {
        FrameCodec {
            marker_run: marker_run.max(1),
        }
    }

    pub fn encode(&self, frame: &LinkFrame) -> Result<Vec<u8>, LinkError> {
        let (frame_type, frame_seq, payload) = match frame {
            LinkFrame::Data { frame_seq, payload } => (TYPE_DATA, *frame_seq, payload.as_slice()),
            LinkFrame::Ack { frame_seq } => (TYPE_ACK, *frame_seq, &[][..]),
        };
        if payload.len() > FRAME_MAX_BYTES {
            return Err(LinkError::PayloadTooLarge {
                len: payload.len(),
                max: FRAME_MAX_BYTES,
            });
        }

        let mut inner = Vec::with_capacity(INNER_OVERHEAD + payload.len());
        inner.push(frame_type);
        inner.extend_from_slice(&frame_seq.to_be_bytes());
        inner.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        inner.extend_from_slice(payload);
        inner.extend_from_slice(&checksum(&inner).to_be_bytes());

        let encoded = cobs::encode_vec(&inner);
        let mut out = Vec::with_capacity(encoded.len() + self.marker_run * 2);
        out.extend(std::iter::repeat(0u8).take(self.marker_run));
        out.extend_from_slice(&encoded);
        out.extend(std::iter::repeat(0u8).take(self.marker_run));
        Ok(out)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeframerStats {
    pub frames_decoded: u64,
    pub crc_failures: u64,
    pub decode_failures: u64,
}

/// Streaming decoder: feed raw medium bytes, get back whole link frames.
///
/// Corrupt candidates (COBS errors, layout mismatches, CRC failures) are
/// counted and dropped; a single flipped bit never yields wrong payload
/// bytes.
#[derive(Debug, Default)]
pub struct Deframer {
    buf: Vec<u8>,
    stats: DeframerStats,
}

impl Deframer {
    pub fn new() -> Deframer {
        Deframer::default()
    }

    pub fn stats(&self) -> DeframerStats {
        self.stats
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<LinkFrame> {
        self.buf.extend_from_slice(bytes);

        let mut frames = Vec::new();
        loop {
            // Leading zeros are marker/idle bytes.
            let start = match self.buf.iter().position(|b| *b != 0) {
                Some(idx) => idx,
                None => {
                    self.buf.clear();
                    break;
                }
            };
            // A frame candidate is a zero-free run terminated by a zero.
            let end = match self.buf[start..].iter().position(|b| *b == 0) {
                Some(rel) => start + rel,
                None => {
                    // Partial frame; keep the tail for the next feed. A run
                    // longer than any legal COBS frame is noise, not a frame.
                    self.buf.drain(..start);
                    let max_candidate = FRAME_MAX_BYTES + INNER_OVERHEAD + FRAME_MAX_BYTES / 254 + 2;
                    if self.buf.len() > max_candidate {
                        self.stats.decode_failures += 1;
                        self.buf.clear();
                    }
                    break;
                }
            };

            let candidate = self.buf[start..end].to_vec();
            if let Some(frame) = self.decode_candidate(&candidate) {
                frames.push(frame);
            }
            self.buf.drain(..end);
        }
        frames
    }

    fn decode_candidate(&mut self, candidate: &[u8]) -> Option<LinkFrame> {
        let inner = match cobs::decode_vec(candidate) {
            Ok(inner) => inner,
            Err(_) => {
                self.stats.decode_failures += 1;
                return None;
            }
        };
        match parse_inner(&inner) {
            Ok(frame) => {
                self.stats.frames_decoded += 1;
                Some(frame)
            }
            Err(ParseError::Crc) => {
                self.stats.crc_failures += 1;
                None
            }
            Err(ParseError::Layout) => {
                self.stats.decode_failures += 1;
                None
            }
        }
    }
}

enum ParseError {
    Layout,
    Crc,
}

fn parse_inner(inner: &[u8]) -> Result<LinkFrame, ParseError> {
    if inner.len() < INNER_OVERHEAD {
        return Err(ParseError::Layout);
    }

    let frame_type = inner[0];
    let frame_seq = u32::from_be_bytes([inner[1], inner[2], inner[3], inner[4]]);
    let len = u16::from_be_bytes([inner[5], inner[6]]) as usize;
    if len > FRAME_MAX_BYTES || inner.len() != INNER_OVERHEAD + len {
        return Err(ParseError::Layout);
    }

    let crc_offset = 7 + len;
    let expected = u32::from_be_bytes([
        inner[crc_offset],
        inner[crc_offset + 1],
        inner[crc_offset + 2],
        inner[crc_offset + 3],
    ]);
    if checksum(&inner[..crc_offset]) != expected {
        return Err(ParseError::Crc);
    }

    match frame_type {
        TYPE_DATA => Ok(LinkFrame::Data {
            frame_seq,
            payload: inner[7..crc_offset].to_vec(),
        }),
        TYPE_ACK if len == 0 => Ok(LinkFrame::Ack { frame_seq }),
        _ => Err(ParseError::Layout),
    }
}

fn checksum(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(frame_seq: u32, payload: &[u8]) -> LinkFrame {
        LinkFrame::Data {
            frame_seq,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn frame_round_trips_through_the_codec() {
        let codec = FrameCodec::new(3);
        let frame = data(7, b"{\"kind\":\"pty_input\"}");
        let wire = codec.encode(&frame).unwrap();
        assert!(wire.starts_with(&[0, 0, 0]));
        assert!(wire.ends_with(&[0, 0, 0]));

        let mut deframer = Deframer::new();
        assert_eq!(deframer.feed(&wire), vec![frame]);
    }

    #[test]
    fn payload_zero_bytes_survive_cobs() {
        let codec = FrameCodec::new(3);
        let frame = data(1, &[0x00, 0x01, 0x00, 0x00, 0xff]);
        let wire = codec.encode(&frame).unwrap();
        // Only the marker runs may contain zeros.
        let body = &wire[3..wire.len() - 3];
        assert!(body.iter().all(|b| *b != 0));

        let mut deframer = Deframer::new();
        assert_eq!(deframer.feed(&wire), vec![frame]);
    }

    #[test]
    fn ack_frames_carry_only_a_seq() {
        let codec = FrameCodec::new(3);
        let wire = codec.encode(&LinkFrame::Ack { frame_seq: 42 }).unwrap();
        let mut deframer = Deframer::new();
        assert_eq!(deframer.feed(&wire), vec![LinkFrame::Ack { frame_seq: 42 }]);
    }

    #[test]
    fn split_delivery_reassembles() {
        let codec = FrameCodec::new(3);
        let frame = data(9, &[1, 2, 3, 4, 5, 6, 7, 8]);
        let wire = codec.encode(&frame).unwrap();

        let mut deframer = Deframer::new();
        let (head, tail) = wire.split_at(wire.len() / 2);
        assert!(deframer.feed(head).is_empty());
        assert_eq!(deframer.feed(tail), vec![frame]);
    }

    #[test]
    fn back_to_back_frames_both_decode() {
        let codec = FrameCodec::new(3);
        let first = data(1, b"first");
        let second = data(2, b"second");
        let mut wire = codec.encode(&first).unwrap();
        wire.extend(codec.encode(&second).unwrap());

        let mut deframer = Deframer::new();
        assert_eq!(deframer.feed(&wire), vec![first, second]);
    }

    #[test]
    fn single_bit_corruption_yields_nothing() {
        let codec = FrameCodec::new(3);
        let frame = data(5, b"sensitive payload bytes");
        let clean = codec.encode(&frame).unwrap();

        // Flip one bit in every non-marker position in turn; no position may
        // produce a wrong frame.
        for idx in 3..clean.len() - 3 {
            for bit in 0..8 {
                let mut corrupted = clean.clone();
                corrupted[idx] ^= 1 << bit;
                let mut deframer = Deframer::new();
                for decoded in deframer.feed(&corrupted) {
                    assert_eq!(decoded, frame, "corruption at byte {idx} bit {bit}");
                }
            }
        }
    }

    #[test]
    fn garbage_between_frames_is_skipped() {
        let codec = FrameCodec::new(3);
        let frame = data(3, b"ok");
        let mut wire = vec![0x00, 0x41, 0x42, 0x43, 0x00];
        wire.extend(codec.encode(&frame).unwrap());

        let mut deframer = Deframer::new();
        assert_eq!(deframer.feed(&wire), vec![frame]);
        assert!(deframer.stats().decode_failures + deframer.stats().crc_failures >= 1);
    }

    #[test]
    fn oversized_payload_is_refused_at_encode_time() {
        let codec = FrameCodec::new(3);
        let frame = data(1, &vec![0xaa; FRAME_MAX_BYTES + 1]);
        assert!(matches!(
            codec.encode(&frame),
            Err(LinkError::PayloadTooLarge { .. })
        ));
    }
}
