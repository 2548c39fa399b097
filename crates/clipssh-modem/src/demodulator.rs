//! Streaming FSK demodulation: samples → symbols → payload byte chunks.

use crate::modulator::bytes_from_bits;
use crate::profile::ModemProfile;

/// Sentinel for a symbol window whose energy sat below the running floor.
/// Never matches a sync pattern; decodes as carrier 0 if it lands inside a
/// data region (the frame CRC catches the damage).
const SILENT: u8 = 0xff;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ModemStats {
    pub chunks_decoded: u64,
    pub sync_hits: u64,
    pub decode_failures: u64,
    pub silent_symbols: u64,
}

/// Sliding Goertzel bank over fixed symbol windows, with sync-pattern
/// search and per-bit majority de-repeat. Emits the raw byte chunks found
/// between start and end sync words; marker/COBS/CRC deframing happens in
/// the link layer.
#[derive(Debug)]
pub struct Demodulator {
    profile: ModemProfile,
    coeffs: Vec<f64>,
    start_gate: Vec<u8>,
    sample_buf: Vec<i16>,
    symbols: Vec<u8>,
    energy_peak: f64,
    stats: ModemStats,
}

impl Demodulator {
    pub fn new(profile: ModemProfile) -> Demodulator {
        let coeffs = profile
            .carriers
            .iter()
            .map(|freq| {
                let step =
                    std::f64::consts::TAU * f64::from(*freq) / f64::from(profile.sample_rate);
                2.0 * step.cos()
            })
            .collect();
        let start_gate = profile.start_gate();
        Demodulator {
            profile,
            coeffs,
            start_gate,
            sample_buf: Vec::new(),
            symbols: Vec::new(),
            energy_peak: 0.0,
            stats: ModemStats::default(),
        }
    }

    pub fn profile(&self) -> &ModemProfile {
        &self.profile
    }

    pub fn stats(&self) -> ModemStats {
        self.stats
    }

    /// Feed PCM samples; returns any completed payload byte chunks.
    pub fn feed(&mut self, samples: &[i16]) -> Vec<Vec<u8>> {
        self.sample_buf.extend_from_slice(samples);

        let window = self.profile.samples_per_symbol;
        let whole = (self.sample_buf.len() / window) * window;
        for start in (0..whole).step_by(window) {
            let symbol = self.detect_symbol(start, window);
            self.symbols.push(symbol);
        }
        self.sample_buf.drain(..whole);

        self.extract_chunks()
    }

    fn detect_symbol(&mut self, start: usize, window: usize) -> u8 {
        let samples = &self.sample_buf[start..start + window];

        let mut best_idx = 0usize;
        let mut best_power = f64::MIN;
        for (idx, coeff) in self.coeffs.iter().enumerate() {
            let power = goertzel_power(samples, *coeff);
            if power > best_power {
                best_power = power;
                best_idx = idx;
            }
        }

        self.energy_peak *= 0.999;
        let silent = best_power <= f64::EPSILON
            || (self.energy_peak > 0.0 && best_power < self.energy_peak * 1e-4);
        if best_power > self.energy_peak {
            self.energy_peak = best_power;
        }
        if silent {
            self.stats.silent_symbols += 1;
            return SILENT;
        }
        best_idx as u8
    }

    fn extract_chunks(&mut self) -> Vec<Vec<u8>> {
        let mut chunks = Vec::new();

        loop {
            let start_idx = match find_symbol_pattern(
                &self.symbols,
                &self.start_gate,
                0,
                self.profile.start_max_errors,
            ) {
                Some(idx) => idx,
                None => {
                    let keep = (self.start_gate.len() * 2).max(256);
                    if self.symbols.len() > keep {
                        let drop = self.symbols.len() - keep;
                        self.symbols.drain(..drop);
                    }
                    break;
                }
            };

            let data_start = start_idx + self.start_gate.len();
            let end_idx = match find_symbol_pattern(
                &self.symbols,
                &self.profile.end_sync,
                data_start,
                self.profile.end_max_errors,
            ) {
                Some(idx) => idx,
                None => {
                    if start_idx > 0 {
                        self.symbols.drain(..start_idx);
                    }
                    break;
                }
            };

            self.stats.sync_hits += 1;
            let data_symbols: Vec<u8> = self.symbols[data_start..end_idx].to_vec();
            self.symbols
                .drain(..end_idx + self.profile.end_sync.len());

            match self.decode_data_symbols(&data_symbols) {
                Some(chunk) => {
                    self.stats.chunks_decoded += 1;
                    chunks.push(chunk);
                }
                None => self.stats.decode_failures += 1,
            }
        }
        chunks
    }

    fn decode_data_symbols(&self, symbols: &[u8]) -> Option<Vec<u8>> {
        if symbols.is_empty() {
            return None;
        }

        let mut bits = Vec::with_capacity(symbols.len() * self.profile.bits_per_symbol);
        for symbol in symbols {
            let value = if *symbol == SILENT { 0 } else { *symbol };
            let mapped = self.profile.bits_for_symbol(value);
            for shift in (0..self.profile.bits_per_symbol).rev() {
                bits.push((mapped >> shift) & 0x1);
            }
        }

        if self.profile.bit_repeat > 1 {
            bits = bits
                .chunks_exact(self.profile.bit_repeat)
                .map(|group| {
                    let ones: usize = group.iter().map(|bit| usize::from(*bit)).sum();
                    u8::from(ones * 2 >= group.len())
                })
                .collect();
        }

        let bytes = bytes_from_bits(&bits);
        if bytes.is_empty() {
            return None;
        }
        Some(bytes)
    }
}

/// First index at or after `start` where `pattern` matches `symbols` with at
/// most `max_errors` mismatches.
fn find_symbol_pattern(
    symbols: &[u8],
    pattern: &[u8],
    start: usize,
    max_errors: usize,
) -> Option<usize> {
    if pattern.is_empty() || symbols.len() < pattern.len() {
        return None;
    }
    let last_start = symbols.len() - pattern.len();
    for idx in start..=last_start {
        let mut errors = 0;
        let mut matched = true;
        for (offset, expected) in pattern.iter().enumerate() {
            if symbols[idx + offset] != *expected {
                errors += 1;
                if errors > max_errors {
                    matched = false;
                    break;
                }
            }
        }
        if matched {
            return Some(idx);
        }
    }
    None
}

fn goertzel_power(samples: &[i16], coeff: f64) -> f64 {
    let mut s_prev = 0.0f64;
    let mut s_prev2 = 0.0f64;
    for sample in samples {
        let s = f64::from(*sample) + coeff * s_prev - s_prev2;
        s_prev2 = s_prev;
        s_prev = s;
    }
    s_prev2 * s_prev2 + s_prev * s_prev - coeff * s_prev * s_prev2
}
