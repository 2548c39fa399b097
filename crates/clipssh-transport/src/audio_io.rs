//! PCM capture/playback backends for the audio modem.
//!
//! The server side drives PulseAudio through `parec`/`pacat` child
//! processes; the client side drives PipeWire through `pw-cat` (with
//! `pw-link` wiring as belt and braces). A WAV file can substitute live
//! capture for offline channel analysis. All backends speak 48 kHz mono
//! s16le byte streams.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use clipssh_modem::SAMPLE_RATE;

use crate::{Result, TransportError};

#[async_trait]
pub trait AudioIo: Send {
    fn name(&self) -> &str;

    /// Read captured PCM bytes; blocks until some are available.
    async fn read_pcm(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Queue PCM bytes for playback.
    async fn write_pcm(&mut self, pcm: &[u8]) -> Result<()>;

    async fn close(&mut self);
}

// --- PulseAudio (server side) ---

pub struct PulseAudioIo {
    capture: Child,
    capture_out: ChildStdout,
    playback: Child,
    playback_in: ChildStdin,
}

impl PulseAudioIo {
    /// Capture from the default source and play to the default sink.
    pub fn spawn() -> Result<PulseAudioIo> {
        let mut capture = spawn_tool(
            "parec",
            &[
                "--format=s16le",
                &format!("--rate={SAMPLE_RATE}"),
                "--channels=1",
            ],
            Stdio::null(),
            Stdio::piped(),
        )?;
        let capture_out = capture
            .stdout
            .take()
            .ok_or_else(|| TransportError::Setup("parec stdout unavailable".into()))?;

        let mut playback = spawn_tool(
            "pacat",
            &[
                "--playback",
                "--format=s16le",
                &format!("--rate={SAMPLE_RATE}"),
                "--channels=1",
            ],
            Stdio::piped(),
            Stdio::null(),
        )?;
        let playback_in = playback
            .stdin
            .take()
            .ok_or_else(|| TransportError::Setup("pacat stdin unavailable".into()))?;

        Ok(PulseAudioIo {
            capture,
            capture_out,
            playback,
            playback_in,
        })
    }
}

#[async_trait]
impl AudioIo for PulseAudioIo {
    fn name(&self) -> &str {
        "pulse:default"
    }

    async fn read_pcm(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.capture_out.read(buf).await {
            Ok(0) => Err(TransportError::Broken("parec stream ended".into())),
            Ok(n) => Ok(n),
            Err(err) => Err(TransportError::Broken(format!("parec read: {err}"))),
        }
    }

    async fn write_pcm(&mut self, pcm: &[u8]) -> Result<()> {
        self.playback_in
            .write_all(pcm)
            .await
            .map_err(|err| TransportError::Broken(format!("pacat write: {err}")))
    }

    async fn close(&mut self) {
        let _ = self.playback_in.shutdown().await;
        let _ = self.capture.start_kill();
        let _ = self.playback.start_kill();
    }
}

// --- PipeWire (client side) ---

#[derive(Debug, Clone, Default)]
pub struct PipeWireConfig {
    pub capture_node_id: Option<u32>,
    pub capture_match: Option<String>,
    pub write_node_id: Option<u32>,
    pub write_match: Option<String>,
    pub skip_preflight: bool,
}

pub struct PipeWireIo {
    name: String,
    capture: Child,
    capture_out: ChildStdout,
    playback: Child,
    playback_in: ChildStdin,
}

impl PipeWireIo {
    pub async fn spawn(config: PipeWireConfig) -> Result<PipeWireIo> {
        let graph = if config.skip_preflight {
            None
        } else {
            Some(PipeWireGraph::dump().await?)
        };

        let capture_target = resolve_target(
            graph.as_ref(),
            config.capture_node_id,
            config.capture_match.as_deref(),
            "capture",
        )?;
        let write_target = resolve_target(
            graph.as_ref(),
            config.write_node_id,
            config.write_match.as_deref(),
            "write",
        )?;

        if let Some(graph) = &graph {
            graph.preflight(capture_target, write_target)?;
        }

        let mut capture_args = vec![
            "--record".to_string(),
            "-".to_string(),
            "--rate".to_string(),
            SAMPLE_RATE.to_string(),
            "--channels".to_string(),
            "1".to_string(),
            "--format".to_string(),
            "s16".to_string(),
        ];
        if let Some(target) = capture_target {
            capture_args.push("--target".to_string());
            capture_args.push(target.to_string());
        }
        let mut capture = spawn_tool(
            "pw-cat",
            &capture_args.iter().map(String::as_str).collect::<Vec<_>>(),
            Stdio::null(),
            Stdio::piped(),
        )?;
        let capture_out = capture
            .stdout
            .take()
            .ok_or_else(|| TransportError::Setup("pw-cat record stdout unavailable".into()))?;

        let mut playback_args = vec![
            "--playback".to_string(),
            "-".to_string(),
            "--rate".to_string(),
            SAMPLE_RATE.to_string(),
            "--channels".to_string(),
            "1".to_string(),
            "--format".to_string(),
            "s16".to_string(),
        ];
        if let Some(target) = write_target {
            playback_args.push("--target".to_string());
            playback_args.push(target.to_string());
        }
        let mut playback = spawn_tool(
            "pw-cat",
            &playback_args.iter().map(String::as_str).collect::<Vec<_>>(),
            Stdio::piped(),
            Stdio::null(),
        )?;
        let playback_in = playback
            .stdin
            .take()
            .ok_or_else(|| TransportError::Setup("pw-cat playback stdin unavailable".into()))?;

        // Route our streams explicitly where the graph allows it; --target
        // is advisory on some session managers.
        if let Some(target) = write_target {
            wire_best_effort("output.clipssh", &target.to_string()).await;
        }
        if let Some(target) = capture_target {
            wire_best_effort(&target.to_string(), "input.clipssh").await;
        }

        let name = format!(
            "pipewire:capture={},write={}",
            capture_target.map_or("default".to_string(), |id| id.to_string()),
            write_target.map_or("default".to_string(), |id| id.to_string()),
        );
        Ok(PipeWireIo {
            name,
            capture,
            capture_out,
            playback,
            playback_in,
        })
    }
}

#[async_trait]
impl AudioIo for PipeWireIo {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read_pcm(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.capture_out.read(buf).await {
            Ok(0) => Err(TransportError::Broken("pw-cat capture ended".into())),
            Ok(n) => Ok(n),
            Err(err) => Err(TransportError::Broken(format!("pw-cat read: {err}"))),
        }
    }

    async fn write_pcm(&mut self, pcm: &[u8]) -> Result<()> {
        self.playback_in
            .write_all(pcm)
            .await
            .map_err(|err| TransportError::Broken(format!("pw-cat write: {err}")))
    }

    async fn close(&mut self) {
        let _ = self.playback_in.shutdown().await;
        let _ = self.capture.start_kill();
        let _ = self.playback.start_kill();
    }
}

/// Parsed `pw-dump` snapshot: enough of the graph to pick nodes and verify
/// they expose ports.
struct PipeWireGraph {
    objects: Vec<serde_json::Value>,
}

impl PipeWireGraph {
    async fn dump() -> Result<PipeWireGraph> {
        let output = Command::new("pw-dump")
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .await
            .map_err(|err| {
                TransportError::Setup(format!(
                    "pw-dump failed (is PipeWire running?): {err}"
                ))
            })?;
        if !output.status.success() {
            return Err(TransportError::Setup(
                "pw-dump exited nonzero; PipeWire daemon unreachable".into(),
            ));
        }
        let objects: Vec<serde_json::Value> = serde_json::from_slice(&output.stdout)
            .map_err(|err| TransportError::Setup(format!("pw-dump parse: {err}")))?;
        Ok(PipeWireGraph { objects })
    }

    fn nodes(&self) -> impl Iterator<Item = &serde_json::Value> {
        self.objects.iter().filter(|obj| {
            obj.get("type").and_then(|t| t.as_str()) == Some("PipeWire:Interface:Node")
        })
    }

    fn node_props<'a>(node: &'a serde_json::Value) -> Option<&'a serde_json::Value> {
        node.get("info").and_then(|info| info.get("props"))
    }

    fn find_by_match(&self, pattern: &str) -> Result<u32> {
        let regex = regex::Regex::new(pattern).map_err(|err| {
            TransportError::Setup(format!("invalid node match pattern '{pattern}': {err}"))
        })?;
        let mut matches = Vec::new();
        for node in self.nodes() {
            let Some(props) = Self::node_props(node) else { continue };
            let mut haystacks = Vec::new();
            for key in ["node.name", "node.description", "media.name"] {
                if let Some(value) = props.get(key).and_then(|v| v.as_str()) {
                    haystacks.push(value);
                }
            }
            if haystacks.iter().any(|hay| regex.is_match(hay)) {
                if let Some(id) = node.get("id").and_then(|id| id.as_u64()) {
                    matches.push(id as u32);
                }
            }
        }
        match matches.as_slice() {
            [] => Err(TransportError::Setup(format!(
                "no PipeWire node matches '{pattern}'"
            ))),
            [only] => Ok(*only),
            many => Err(TransportError::Setup(format!(
                "pattern '{pattern}' matches {} nodes ({:?}); narrow it down",
                many.len(),
                many
            ))),
        }
    }

    fn has_node(&self, id: u32) -> bool {
        self.nodes()
            .any(|node| node.get("id").and_then(|i| i.as_u64()) == Some(u64::from(id)))
    }

    fn node_has_ports(&self, id: u32) -> bool {
        self.objects.iter().any(|obj| {
            obj.get("type").and_then(|t| t.as_str()) == Some("PipeWire:Interface:Port")
                && obj
                    .get("info")
                    .and_then(|info| info.get("props"))
                    .and_then(|props| props.get("node.id"))
                    .and_then(|node_id| node_id.as_u64())
                    == Some(u64::from(id))
        })
    }

    fn has_session_manager(&self) -> bool {
        self.objects.iter().any(|obj| {
            let Some(props) = obj.get("info").and_then(|info| info.get("props")) else {
                return false;
            };
            props
                .get("application.name")
                .and_then(|name| name.as_str())
                .map(|name| {
                    let lowered = name.to_ascii_lowercase();
                    lowered.contains("wireplumber") || lowered.contains("session-manager")
                })
                .unwrap_or(false)
        })
    }

    fn preflight(&self, capture: Option<u32>, write: Option<u32>) -> Result<()> {
        if !self.has_session_manager() {
            return Err(TransportError::Setup(
                "no PipeWire session manager found; audio nodes will not link \
                 (start wireplumber, or pass --skip-pw-preflight to override)"
                    .into(),
            ));
        }
        for (label, id) in [("capture", capture), ("write", write)] {
            if let Some(id) = id {
                if !self.has_node(id) {
                    return Err(TransportError::Setup(format!(
                        "{label} node {id} not present in the PipeWire graph"
                    )));
                }
                if !self.node_has_ports(id) {
                    return Err(TransportError::Setup(format!(
                        "{label} node {id} has no ports; it cannot carry audio"
                    )));
                }
            }
        }
        Ok(())
    }
}

fn resolve_target(
    graph: Option<&PipeWireGraph>,
    id: Option<u32>,
    pattern: Option<&str>,
    label: &str,
) -> Result<Option<u32>> {
    match (id, pattern) {
        (Some(_), Some(_)) => Err(TransportError::Setup(format!(
            "give either a {label} node id or a {label} match pattern, not both"
        ))),
        (Some(id), None) => Ok(Some(id)),
        (None, Some(pattern)) => match graph {
            Some(graph) => graph.find_by_match(pattern).map(Some),
            None => Err(TransportError::Setup(format!(
                "{label} match patterns require the preflight graph; \
                 drop --skip-pw-preflight or use an explicit node id"
            ))),
        },
        (None, None) => Ok(None),
    }
}

async fn wire_best_effort(from: &str, to: &str) {
    match Command::new("pw-link")
        .args([from, to])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
    {
        Ok(status) if status.success() => {
            tracing::debug!(from, to, "pw-link wired nodes");
        }
        Ok(status) => tracing::debug!(from, to, %status, "pw-link declined (often already linked)"),
        Err(err) => tracing::debug!(from, to, error = %err, "pw-link unavailable"),
    }
}

fn spawn_tool(binary: &str, args: &[&str], stdin: Stdio, stdout: Stdio) -> Result<Child> {
    Command::new(binary)
        .args(args)
        .stdin(stdin)
        .stdout(stdout)
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| {
            TransportError::Setup(format!(
                "failed to start {binary} (is it installed?): {err}"
            ))
        })
}

// --- WAV replay capture ---

/// Replays a PCM16 WAV file in place of live capture, at roughly real-time
/// pace. Stereo content is averaged down to mono. Playback writes are
/// discarded.
pub struct WavCaptureIo {
    name: String,
    pcm: Vec<u8>,
    offset: usize,
    chunk_bytes: usize,
}

impl WavCaptureIo {
    pub fn open(path: PathBuf) -> Result<WavCaptureIo> {
        let raw = std::fs::read(&path).map_err(|err| {
            TransportError::Setup(format!("cannot read WAV file {}: {err}", path.display()))
        })?;
        let pcm = parse_wav_pcm16_mono(&raw).map_err(|err| {
            TransportError::Setup(format!("{}: {err}", path.display()))
        })?;
        Ok(WavCaptureIo {
            name: format!("wav:{}", path.display()),
            pcm,
            offset: 0,
            // ~20 ms of mono s16 at 48 kHz per read keeps the demodulator
            // fed at a live-capture cadence.
            chunk_bytes: (SAMPLE_RATE as usize / 50) * 2,
        })
    }
}

#[async_trait]
impl AudioIo for WavCaptureIo {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read_pcm(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.offset >= self.pcm.len() {
            // File exhausted: report silence at a slow idle pace.
            tokio::time::sleep(Duration::from_millis(100)).await;
            let fill = buf.len().min(self.chunk_bytes);
            buf[..fill].fill(0);
            return Ok(fill);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        let take = buf.len().min(self.chunk_bytes).min(self.pcm.len() - self.offset);
        buf[..take].copy_from_slice(&self.pcm[self.offset..self.offset + take]);
        self.offset += take;
        Ok(take)
    }

    async fn write_pcm(&mut self, _pcm: &[u8]) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) {}
}

/// Extract s16le mono samples from a RIFF/WAVE byte blob. Stereo is
/// downmixed by averaging the channel pair.
fn parse_wav_pcm16_mono(raw: &[u8]) -> std::result::Result<Vec<u8>, String> {
    if raw.len() < 12 || &raw[0..4] != b"RIFF" || &raw[8..12] != b"WAVE" {
        return Err("not a RIFF/WAVE file".into());
    }

    let mut channels = 0u16;
    let mut bits = 0u16;
    let mut data: Option<&[u8]> = None;

    let mut cursor = 12usize;
    while cursor + 8 <= raw.len() {
        let chunk_id = &raw[cursor..cursor + 4];
        let chunk_len =
            u32::from_le_bytes([raw[cursor + 4], raw[cursor + 5], raw[cursor + 6], raw[cursor + 7]])
                as usize;
        let body_start = cursor + 8;
        let body_end = (body_start + chunk_len).min(raw.len());
        let body = &raw[body_start..body_end];

        match chunk_id {
            b"fmt " => {
                if body.len() < 16 {
                    return Err("truncated fmt chunk".into());
                }
                let format = u16::from_le_bytes([body[0], body[1]]);
                if format != 1 {
                    return Err(format!("unsupported WAV format {format} (want PCM)"));
                }
                channels = u16::from_le_bytes([body[2], body[3]]);
                bits = u16::from_le_bytes([body[14], body[15]]);
            }
            b"data" => data = Some(body),
            _ => {}
        }
        // Chunks are word-aligned.
        cursor = body_start + chunk_len + (chunk_len & 1);
    }

    if bits != 16 {
        return Err(format!("unsupported sample width {bits} (want 16)"));
    }
    let data = data.ok_or_else(|| "missing data chunk".to_string())?;

    match channels {
        1 => Ok(data.to_vec()),
        2 => {
            let mut mono = Vec::with_capacity(data.len() / 2);
            for frame in data.chunks_exact(4) {
                let left = i16::from_le_bytes([frame[0], frame[1]]) as i32;
                let right = i16::from_le_bytes([frame[2], frame[3]]) as i32;
                let mixed = ((left + right) / 2) as i16;
                mono.extend_from_slice(&mixed.to_le_bytes());
            }
            Ok(mono)
        }
        other => Err(format!("unsupported channel count {other}")),
    }
}
