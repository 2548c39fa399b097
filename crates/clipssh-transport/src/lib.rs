//! Pluggable transports: every side channel presented as an ordered
//! best-effort duplex link of discrete envelopes.
//!
//! Each adapter owns its medium resources (child processes, fds, audio
//! streams) inside one or more worker tasks; the adapter value the session
//! holds is a channel facade. Inbound envelopes are deduplicated by msg_id
//! before delivery, so `recv` hands each distinct message up at most once
//! for the lifetime of the transport.

pub mod audio;
pub mod audio_io;
pub mod clipboard;
pub mod drive;
pub mod git;
pub mod serial;

mod facade;

pub use facade::{channel_pair, TransportChannels, WorkerSide};

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use clipssh_protocol::Envelope;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),

    #[error("transport broken: {0}")]
    Broken(String),

    #[error("transport is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Capacity of the inbound/outbound envelope queues; a full queue blocks
/// the producer.
pub const QUEUE_CAPACITY: usize = 256;

/// Longest interval a blocking worker may go without checking shutdown.
pub const SHUTDOWN_POLL: Duration = Duration::from_millis(250);

/// Deadline for draining queued outbound envelopes during close.
pub const DRAIN_DEADLINE: Duration = Duration::from_secs(1);

/// The capability set every medium exposes to the session layer.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the link layer itself acknowledges and retransmits frames.
    /// When true the session layer must not run its own retry schedule.
    fn link_reliable(&self) -> bool {
        false
    }

    /// Best-effort: place the envelope on the medium (or queue it for the
    /// worker). Delivery is not guaranteed.
    async fn send(&self, envelope: Envelope) -> Result<()>;

    /// Wait up to `timeout` for the next inbound envelope. `Ok(None)` means
    /// the timeout elapsed; a broken medium reports an error.
    async fn recv(&self, timeout: Duration) -> Result<Option<Envelope>>;

    /// Drain outbound traffic (bounded) and release medium resources.
    async fn close(&self);
}
