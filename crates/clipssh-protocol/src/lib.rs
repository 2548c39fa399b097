//! Message protocol shared by every clipssh transport.
//!
//! An [`Envelope`] is one session-layer message: routing fields plus a
//! kind-specific body. Envelopes are serialized as a single JSON object with
//! the keys `protocol`, `kind`, `session_id`, `msg_id`, `seq`, `ts`,
//! `source`, `target`, `body`. The clipboard dialect additionally wraps the
//! JSON in a tagged base64 line (see [`wire`]).

pub mod envelope;
pub mod wire;

mod session;

pub use envelope::{Body, Envelope, Protocol, ProtocolError, Role, SignalName};
pub use session::{DedupWindow, SeqGen};

/// Wire name of the clipboard command/reply dialect.
pub const PROTOCOL_CLIPSSH: &str = "CLIPSSH/1";
/// Wire name of the interactive PTY dialect.
pub const PROTOCOL_GITSSH: &str = "gitssh/2";

/// Default capacity of a receiver's seen-msg-id window.
pub const DEDUP_WINDOW_CAPACITY: usize = 4096;

/// Largest chunk of PTY or command output carried by a single envelope.
pub const MAX_CHUNK_BYTES: usize = 4096;
