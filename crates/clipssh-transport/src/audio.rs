//! Audio-modem transport: envelopes over a real PCM path.
//!
//! Transmit pipeline: envelope JSON → link frame (marker+COBS+CRC) →
//! byte-repeat FEC → FSK modulation → PCM out. Receive reverses it. Link
//! ACK/retry makes the medium reliable from the session layer's point of
//! view; with `auto` modulation the transmit profile steps down the ladder
//! after repeated retry exhaustion, and one demodulator lane per profile
//! keeps a downgraded peer decodable.

use std::time::{Duration, Instant};

use async_trait::async_trait;

use clipssh_link::{fec, Deframer, FrameCodec, LinkError, LinkFrame, LinkReliability, ReliabilityConfig};
use clipssh_modem::{Demodulator, Modulation, ModemProfile, Modulator};
use clipssh_protocol::Envelope;

use crate::audio_io::AudioIo;
use crate::facade::{channel_pair, TransportChannels, WorkerSide};
use crate::{Result, Transport};

/// Prefix of link payloads that are channel diagnostics, not envelopes.
const DIAG_PREFIX: &[u8] = b"diag:";

#[derive(Debug, Clone)]
pub struct AudioModemConfig {
    pub modulation: Modulation,
    pub byte_repeat: usize,
    pub marker_run: usize,
    pub ack_timeout: Duration,
    pub max_retries: u32,
    /// Link-retry exhaustions tolerated at one profile before `auto`
    /// steps down the ladder.
    pub auto_downgrade_after_nacks: u64,
    pub diag: DiagConfig,
}

#[derive(Debug, Clone)]
pub struct DiagConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub connect_burst: u32,
}

impl Default for AudioModemConfig {
    fn default() -> Self {
        AudioModemConfig {
            modulation: Modulation::Auto,
            byte_repeat: 3,
            marker_run: clipssh_link::AUDIO_MARKER_RUN,
            ack_timeout: Duration::from_millis(800),
            max_retries: 32,
            auto_downgrade_after_nacks: 2,
            diag: DiagConfig {
                enabled: false,
                interval: Duration::from_millis(1000),
                connect_burst: 4,
            },
        }
    }
}

pub struct AudioModemTransport {
    name: String,
    channels: TransportChannels,
}

impl AudioModemTransport {
    pub fn spawn(io: Box<dyn AudioIo>, config: AudioModemConfig) -> AudioModemTransport {
        let name = format!("audio-modem:{}:{}", config.modulation, io.name());
        let (channels, worker) = channel_pair();
        tokio::spawn(worker_loop(io, worker, config));
        AudioModemTransport { name, channels }
    }
}

#[async_trait]
impl Transport for AudioModemTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn link_reliable(&self) -> bool {
        true
    }

    async fn send(&self, envelope: Envelope) -> Result<()> {
        self.channels.send(envelope).await
    }

    async fn recv(&self, timeout: Duration) -> Result<Option<Envelope>> {
        self.channels.recv(timeout).await
    }

    async fn close(&self) {
        self.channels.close().await;
    }
}

/// One receive lane: a demodulator for a profile plus its own deframer so
/// interleaved chunks from different profiles cannot corrupt each other.
struct RxLane {
    demodulator: Demodulator,
    deframer: Deframer,
}

struct ModemState {
    config: AudioModemConfig,
    codec: FrameCodec,
    ladder: Vec<Modulation>,
    ladder_idx: usize,
    exhaustions_at_profile: u64,
    modulator: Modulator,
    lanes: Vec<RxLane>,
    reliability: LinkReliability,
    pending_pcm_byte: Option<u8>,
    diag_counter: u64,
    diag_pings_seen: u64,
    last_stats_log: Instant,
}

impl ModemState {
    fn new(config: AudioModemConfig) -> ModemState {
        let ladder = config.modulation.tx_ladder();
        let modulator = Modulator::new(ModemProfile::for_modulation(ladder[0]));
        // Listen on every profile the ladder can reach, so a unilaterally
        // downgraded peer stays decodable.
        let lanes = ladder
            .iter()
            .map(|modulation| RxLane {
                demodulator: Demodulator::new(ModemProfile::for_modulation(*modulation)),
                deframer: Deframer::new(),
            })
            .collect();
        let reliability = LinkReliability::new(ReliabilityConfig {
            ack_timeout: config.ack_timeout,
            max_retries: config.max_retries,
            ..ReliabilityConfig::default()
        });
        ModemState {
            codec: FrameCodec::new(config.marker_run),
            ladder,
            ladder_idx: 0,
            exhaustions_at_profile: 0,
            modulator,
            lanes,
            reliability,
            pending_pcm_byte: None,
            diag_counter: 0,
            diag_pings_seen: 0,
            last_stats_log: Instant::now(),
            config,
        }
    }

    fn active_modulation(&self) -> Modulation {
        self.ladder[self.ladder_idx]
    }

    /// Raw PCM bytes → inbound link payloads across all lanes.
    fn ingest_pcm(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        let mut stream = Vec::with_capacity(bytes.len() + 1);
        if let Some(carry) = self.pending_pcm_byte.take() {
            stream.push(carry);
        }
        stream.extend_from_slice(bytes);
        if stream.len() % 2 != 0 {
            self.pending_pcm_byte = stream.pop();
        }
        let samples: Vec<i16> = stream
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();

        let byte_repeat = self.config.byte_repeat;
        let mut payloads = Vec::new();
        for lane in &mut self.lanes {
            for coded in lane.demodulator.feed(&samples) {
                let framed = fec::decode(&coded, byte_repeat);
                for frame in lane.deframer.feed(&framed) {
                    payloads.extend(self.reliability.handle_inbound(frame));
                }
            }
        }
        payloads
    }

    /// Render one link frame to transmit-ready PCM bytes.
    fn frame_to_pcm(&mut self, frame: &LinkFrame) -> Option<Vec<u8>> {
        let wire = match self.codec.encode(frame) {
            Ok(wire) => wire,
            Err(err) => {
                tracing::debug!(error = %err, "dropping unencodable link frame");
                return None;
            }
        };
        let coded = fec::encode(&wire, self.config.byte_repeat);
        let samples = self.modulator.modulate_frame(&coded);
        let mut pcm = Vec::with_capacity(samples.len() * 2);
        for sample in samples {
            pcm.extend_from_slice(&sample.to_le_bytes());
        }
        Some(pcm)
    }

    /// Handle a retry exhaustion: step the auto ladder down (restaging the
    /// dropped payload) or report the link dead.
    fn on_retry_exhausted(&mut self, payload: Vec<u8>) -> std::result::Result<(), String> {
        self.exhaustions_at_profile += 1;
        if self.exhaustions_at_profile < self.config.auto_downgrade_after_nacks
            || self.ladder_idx + 1 >= self.ladder.len()
        {
            if self.ladder_idx + 1 >= self.ladder.len()
                && self.exhaustions_at_profile >= self.config.auto_downgrade_after_nacks
            {
                return Err(format!(
                    "audio link dead at {} after {} unacknowledged frames",
                    self.active_modulation(),
                    self.exhaustions_at_profile
                ));
            }
            // Tolerated; the payload gets another run at the same profile.
            if !payload.is_empty() {
                self.reliability.stage_data(payload);
            }
            return Ok(());
        }

        self.ladder_idx += 1;
        self.exhaustions_at_profile = 0;
        let next = self.active_modulation();
        tracing::warn!(modulation = %next, "downgrading audio modulation");
        self.modulator = Modulator::new(ModemProfile::for_modulation(next));
        if !payload.is_empty() {
            self.reliability.stage_data(payload);
        }
        Ok(())
    }

    fn diag_ping_payload(&mut self) -> Vec<u8> {
        self.diag_counter += 1;
        let mut payload = DIAG_PREFIX.to_vec();
        payload.extend_from_slice(
            format!("{{\"n\":{},\"mod\":\"{}\"}}", self.diag_counter, self.active_modulation())
                .as_bytes(),
        );
        payload
    }

    fn maybe_log_stats(&mut self) {
        if self.last_stats_log.elapsed() < Duration::from_secs(2) {
            return;
        }
        self.last_stats_log = Instant::now();
        for lane in &self.lanes {
            let modem = lane.demodulator.stats();
            let frames = lane.deframer.stats();
            tracing::debug!(
                modulation = %lane.demodulator.profile().modulation,
                sync_hits = modem.sync_hits,
                chunks_decoded = modem.chunks_decoded,
                frames_decoded = frames.frames_decoded,
                crc_failures = frames.crc_failures,
                decode_failures = frames.decode_failures + modem.decode_failures,
                diag_pings_seen = self.diag_pings_seen,
                "audio modem stats"
            );
        }
    }
}

async fn worker_loop(mut io: Box<dyn AudioIo>, mut worker: WorkerSide, config: AudioModemConfig) {
    let mut state = ModemState::new(config);
    let mut ticker = tokio::time::interval(Duration::from_millis(50));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut diag_ticker = tokio::time::interval(state.config.diag.interval);
    diag_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let diag_enabled = state.config.diag.enabled;
    let mut pcm_buf = vec![0u8; 8192];

    loop {
        tokio::select! {
            _ = worker.shutdown_rx.changed() => {
                if worker.is_shutdown() {
                    break;
                }
            }
            envelope = worker.outbound_rx.recv() => {
                let Some(envelope) = envelope else { break };
                match envelope.to_json() {
                    Ok(json) => {
                        state.reliability.stage_data(json.into_bytes());
                    }
                    Err(err) => tracing::debug!(error = %err, "dropping unencodable envelope"),
                }
            }
            read = io.read_pcm(&mut pcm_buf) => {
                let n = match read {
                    Ok(n) => n,
                    Err(err) => {
                        tracing::warn!(error = %err, "audio capture failed");
                        worker.mark_broken(err.to_string());
                        break;
                    }
                };
                let payloads = {
                    let bytes = pcm_buf[..n].to_vec();
                    state.ingest_pcm(&bytes)
                };
                let mut saw_connect = false;
                for payload in payloads {
                    if let Some(delivered) = deliver_payload(&mut worker, &mut state, &payload).await {
                        saw_connect |= delivered;
                    } else {
                        return; // session side gone
                    }
                }
                if saw_connect && diag_enabled {
                    for _ in 0..state.config.diag.connect_burst {
                        let payload = state.diag_ping_payload();
                        let frame = state.reliability.stage_fire_and_forget(payload);
                        if write_frame(&mut io, &mut state, &mut worker, &frame).await.is_err() {
                            return;
                        }
                    }
                }
                state.maybe_log_stats();
            }
            _ = ticker.tick() => {
                if flush_due_frames(&mut io, &mut state, &mut worker).await.is_err() {
                    return;
                }
            }
            _ = diag_ticker.tick(), if diag_enabled => {
                let payload = state.diag_ping_payload();
                let frame = state.reliability.stage_fire_and_forget(payload);
                if write_frame(&mut io, &mut state, &mut worker, &frame).await.is_err() {
                    return;
                }
            }
        }
    }

    // Shutdown: give queued envelopes one last transmission.
    while let Ok(envelope) = worker.outbound_rx.try_recv() {
        if let Ok(json) = envelope.to_json() {
            state.reliability.stage_data(json.into_bytes());
        }
    }
    let _ = flush_due_frames(&mut io, &mut state, &mut worker).await;
    io.close().await;
}

/// Returns Some(is_connect_req) on success, None when the session side is
/// gone.
async fn deliver_payload(
    worker: &mut WorkerSide,
    state: &mut ModemState,
    payload: &[u8],
) -> Option<bool> {
    if payload.starts_with(DIAG_PREFIX) {
        state.diag_pings_seen += 1;
        tracing::trace!(total = state.diag_pings_seen, "diag ping received");
        return Some(false);
    }
    let text = match std::str::from_utf8(payload) {
        Ok(text) => text,
        Err(err) => {
            tracing::debug!(error = %err, "non-utf8 audio payload dropped");
            return Some(false);
        }
    };
    match Envelope::from_json(text) {
        Ok(envelope) => {
            let is_connect = envelope.kind() == "connect_req";
            if worker.deliver(envelope).await {
                Some(is_connect)
            } else {
                None
            }
        }
        Err(err) => {
            tracing::debug!(error = %err, "undecodable audio payload dropped");
            Some(false)
        }
    }
}

async fn flush_due_frames(
    io: &mut Box<dyn AudioIo>,
    state: &mut ModemState,
    worker: &mut WorkerSide,
) -> std::result::Result<(), ()> {
    loop {
        match state.reliability.due_frames(Instant::now()) {
            Ok(frames) => {
                for frame in frames {
                    write_frame(io, state, worker, &frame).await?;
                }
                return Ok(());
            }
            Err(LinkError::RetryExhausted { payload, .. }) => {
                if let Err(reason) = state.on_retry_exhausted(payload) {
                    worker.mark_broken(reason);
                    return Err(());
                }
                // Loop again: remaining due frames still want out.
            }
            Err(err) => {
                worker.mark_broken(err.to_string());
                return Err(());
            }
        }
    }
}

async fn write_frame(
    io: &mut Box<dyn AudioIo>,
    state: &mut ModemState,
    worker: &mut WorkerSide,
    frame: &LinkFrame,
) -> std::result::Result<(), ()> {
    let Some(pcm) = state.frame_to_pcm(frame) else {
        return Ok(());
    };
    if let Err(err) = io.write_pcm(&pcm).await {
        tracing::warn!(error = %err, "audio playback failed");
        worker.mark_broken(err.to_string());
        return Err(());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clipssh_protocol::{Body, Protocol, Role};
    use std::sync::{Arc, Mutex};

    /// Loopback audio channel: what one side plays, the other captures.
    #[derive(Default)]
    struct SharedAir {
        a_to_b: Mutex<Vec<u8>>,
        b_to_a: Mutex<Vec<u8>>,
    }

    struct AirIo {
        air: Arc<SharedAir>,
        is_a: bool,
    }

    #[async_trait]
    impl AudioIo for AirIo {
        fn name(&self) -> &str {
            "loopback"
        }

        async fn read_pcm(&mut self, buf: &mut [u8]) -> Result<usize> {
            loop {
                {
                    let mut inbox = if self.is_a {
                        self.air.b_to_a.lock().unwrap()
                    } else {
                        self.air.a_to_b.lock().unwrap()
                    };
                    if !inbox.is_empty() {
                        let take = buf.len().min(inbox.len());
                        buf[..take].copy_from_slice(&inbox[..take]);
                        inbox.drain(..take);
                        return Ok(take);
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }

        async fn write_pcm(&mut self, pcm: &[u8]) -> Result<()> {
            let mut outbox = if self.is_a {
                self.air.a_to_b.lock().unwrap()
            } else {
                self.air.b_to_a.lock().unwrap()
            };
            outbox.extend_from_slice(pcm);
            Ok(())
        }

        async fn close(&mut self) {}
    }

    fn envelope(seq: u64) -> Envelope {
        Envelope::new(
            Protocol::GitsshV2,
            uuid::Uuid::new_v4().to_string(),
            Role::Client,
            seq,
            Body::PtyInput {
                data: format!("over-the-air-{seq}").into_bytes(),
            },
        )
    }

    fn test_config(modulation: Modulation) -> AudioModemConfig {
        AudioModemConfig {
            modulation,
            ack_timeout: Duration::from_millis(300),
            ..AudioModemConfig::default()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn envelope_crosses_the_audio_loopback() {
        let air = Arc::new(SharedAir::default());
        let a = AudioModemTransport::spawn(
            Box::new(AirIo { air: air.clone(), is_a: true }),
            test_config(Modulation::RobustV1),
        );
        let b = AudioModemTransport::spawn(
            Box::new(AirIo { air: air.clone(), is_a: false }),
            test_config(Modulation::RobustV1),
        );

        let sent = envelope(0);
        a.send(sent.clone()).await.unwrap();
        assert_eq!(b.recv(Duration::from_secs(10)).await.unwrap(), Some(sent));

        a.close().await;
        b.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn auto_sender_reaches_a_fixed_pcoip_receiver() {
        let air = Arc::new(SharedAir::default());
        let a = AudioModemTransport::spawn(
            Box::new(AirIo { air: air.clone(), is_a: true }),
            test_config(Modulation::Auto),
        );
        let b = AudioModemTransport::spawn(
            Box::new(AirIo { air: air.clone(), is_a: false }),
            test_config(Modulation::PcoipSafe),
        );

        let sent = envelope(1);
        a.send(sent.clone()).await.unwrap();
        assert_eq!(b.recv(Duration::from_secs(10)).await.unwrap(), Some(sent));

        a.close().await;
        b.close().await;
    }

    #[test]
    fn downgrade_walks_the_ladder_and_restages_the_payload() {
        let mut state = ModemState::new(AudioModemConfig {
            auto_downgrade_after_nacks: 1,
            ..test_config(Modulation::Auto)
        });
        assert_eq!(state.active_modulation(), Modulation::PcoipSafe);

        state.on_retry_exhausted(b"keep-me".to_vec()).unwrap();
        assert_eq!(state.active_modulation(), Modulation::RobustV1);
        assert_eq!(state.reliability.pending_len(), 1);

        state.on_retry_exhausted(Vec::new()).unwrap();
        assert_eq!(state.active_modulation(), Modulation::Legacy);

        // Ladder exhausted: the next budget overrun is fatal.
        assert!(state.on_retry_exhausted(Vec::new()).is_err());
    }

    #[test]
    fn fixed_modulation_never_downgrades() {
        let mut state = ModemState::new(AudioModemConfig {
            auto_downgrade_after_nacks: 1,
            ..test_config(Modulation::Legacy)
        });
        assert!(state.on_retry_exhausted(Vec::new()).is_err());
        assert_eq!(state.active_modulation(), Modulation::Legacy);
    }

    #[test]
    fn diag_payloads_are_counted_not_delivered() {
        let mut state = ModemState::new(test_config(Modulation::Legacy));
        let ping = state.diag_ping_payload();
        assert!(ping.starts_with(DIAG_PREFIX));
        let again = state.diag_ping_payload();
        assert_ne!(ping, again);
    }
}
