//! Text wire forms used by the line-oriented media.
//!
//! The clipboard carries one tagged line: `CLIPSSH/1 <base64(envelope json)>`.
//! Google Drive log files carry one untagged base64 blob per line. Git blobs
//! and serial/audio frames carry the raw envelope JSON and do not go through
//! this module.

use base64::Engine;

use crate::envelope::{Envelope, ProtocolError};

/// Line prefix that marks clipboard contents as ours.
pub const CLIPBOARD_PREFIX: &str = "CLIPSSH/1 ";

pub fn encode_clipboard_line(envelope: &Envelope) -> Result<String, ProtocolError> {
    let json = envelope.to_json()?;
    let blob = base64::engine::general_purpose::STANDARD.encode(json.as_bytes());
    Ok(format!("{CLIPBOARD_PREFIX}{blob}"))
}

/// Decode a clipboard line. Non-protocol clipboard content (no prefix)
/// reports [`ProtocolError::MissingPrefix`] so callers can ignore it quietly.
pub fn decode_clipboard_line(text: &str) -> Result<Envelope, ProtocolError> {
    let blob = text
        .strip_prefix(CLIPBOARD_PREFIX)
        .ok_or(ProtocolError::MissingPrefix)?;
    decode_base64_json(blob.trim_end())
}

pub fn encode_log_line(envelope: &Envelope) -> Result<String, ProtocolError> {
    let json = envelope.to_json()?;
    Ok(base64::engine::general_purpose::STANDARD.encode(json.as_bytes()))
}

pub fn decode_log_line(line: &str) -> Result<Envelope, ProtocolError> {
    decode_base64_json(line.trim())
}

fn decode_base64_json(blob: &str) -> Result<Envelope, ProtocolError> {
    let raw = base64::engine::general_purpose::STANDARD.decode(blob.as_bytes())?;
    let json = String::from_utf8(raw)?;
    Envelope::from_json(&json)
}
