//! Link-layer framing and reliability shared by the serial and audio media.
//!
//! A link frame is `type | frame_seq | len | payload | crc32`, COBS-encoded
//! so it contains no zero bytes, and delimited on the wire by runs of zero
//! marker bytes. DATA frames are acknowledged per `frame_seq`; unacknowledged
//! frames are retransmitted with a bounded retry budget. The audio medium
//! additionally passes framed bytes through a byte-repeat FEC stage.

pub mod fec;
pub mod frame;
pub mod reliability;

pub use frame::{Deframer, DeframerStats, FrameCodec, LinkFrame};
pub use reliability::{LinkReliability, ReliabilityConfig};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("payload of {len} bytes exceeds frame_max_bytes ({max})")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("frame seq={frame_seq} unacknowledged after {attempts} transmissions")]
    RetryExhausted {
        frame_seq: u32,
        attempts: u32,
        /// The dropped payload, so a caller switching modulation can
        /// restage it instead of losing the message.
        payload: Vec<u8>,
    },
}

/// Default zero-byte run length marking frame boundaries on a serial line.
pub const SERIAL_MARKER_RUN: usize = 3;
/// Default zero-byte run length for the audio medium, where boundary bytes
/// are themselves subject to corruption.
pub const AUDIO_MARKER_RUN: usize = 16;

/// Upper bound on one frame's payload (a serialized envelope).
pub const FRAME_MAX_BYTES: usize = 65536;
