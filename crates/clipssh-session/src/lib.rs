//! Session layer: handshake, retries, ordering and the two application
//! protocols (clipboard command/reply and interactive PTY).

pub mod client;
pub mod pty;
pub mod reorder;
pub mod retry;
pub mod server;

pub use client::{ClientSession, CommandResult, SessionEvent};
pub use server::{run_server, ServerConfig};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("not connected")]
    NotConnected,

    #[error("server is busy with session {session_id}")]
    Busy { session_id: String },

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("shell could not be started: {0}")]
    ShellSpawn(String),

    #[error("peer error {code}: {message}")]
    Peer { code: String, message: String },

    #[error("session closed by peer")]
    Disconnected,

    #[error(transparent)]
    Transport(#[from] clipssh_transport::TransportError),

    #[error("{0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, SessionError>;
