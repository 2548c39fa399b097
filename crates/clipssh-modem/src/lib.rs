//! PCM audio modem: modulation profiles plus pure byte/sample codecs.
//!
//! The modulator and demodulator are pure functions of bytes and `i16`
//! samples; all device I/O lives in the transport layer. A transmission is
//! `preamble + start sync + data symbols + end sync`; the byte payload
//! handed in and out of this crate is the already-framed (and FEC-expanded)
//! link frame byte stream.

pub mod demodulator;
pub mod modulator;
pub mod profile;

pub use demodulator::{Demodulator, ModemStats};
pub use modulator::Modulator;
pub use profile::ModemProfile;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModemError {
    #[error("unsupported audio modulation '{0}' (expected auto, robust-v1, pcoip-safe or legacy)")]
    UnknownModulation(String),
}

/// Audio sample rate used on every medium path.
pub const SAMPLE_RATE: u32 = 48_000;

/// Modulation selector as it appears on the CLI.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Modulation {
    Auto,
    Legacy,
    RobustV1,
    PcoipSafe,
}

impl Modulation {
    pub fn parse(value: &str) -> Result<Modulation, ModemError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => Ok(Modulation::Auto),
            "legacy" => Ok(Modulation::Legacy),
            "robust-v1" => Ok(Modulation::RobustV1),
            "pcoip-safe" => Ok(Modulation::PcoipSafe),
            other => Err(ModemError::UnknownModulation(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Modulation::Auto => "auto",
            Modulation::Legacy => "legacy",
            Modulation::RobustV1 => "robust-v1",
            Modulation::PcoipSafe => "pcoip-safe",
        }
    }

    /// Concrete transmit ladder, fastest profile first. `auto` starts at
    /// pcoip-safe and steps down after repeated link-retry exhaustion;
    /// a fixed selector is a one-entry ladder.
    pub fn tx_ladder(&self) -> Vec<Modulation> {
        match self {
            Modulation::Auto => vec![
                Modulation::PcoipSafe,
                Modulation::RobustV1,
                Modulation::Legacy,
            ],
            fixed => vec![*fixed],
        }
    }
}

impl std::fmt::Display for Modulation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
