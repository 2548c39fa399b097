//! System clipboard as a duplex message medium.
//!
//! One tagged line at a time lives on the clipboard; both peers poll it.
//! The transport remembers what it last wrote (so it does not read its own
//! messages back) and what it last consumed (so a line that survives
//! multiple polls is delivered once). Non-protocol clipboard content is
//! ignored.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use clipssh_protocol::{wire, Envelope};

use crate::facade::{channel_pair, TransportChannels, WorkerSide};
use crate::{Result, Transport, TransportError};

/// How often the worker re-reads the clipboard.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

const PROBE_TEXT: &str = "CLIPSSH/PROBE";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendChoice {
    Auto,
    Wayland,
    Xclip,
    Xsel,
}

impl BackendChoice {
    pub fn parse(value: &str) -> Result<BackendChoice> {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(BackendChoice::Auto),
            "wayland" => Ok(BackendChoice::Wayland),
            "xclip" => Ok(BackendChoice::Xclip),
            "xsel" => Ok(BackendChoice::Xsel),
            other => Err(TransportError::Setup(format!(
                "unknown clipboard backend '{other}' (expected auto, wayland, xclip or xsel)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ClipboardTimeouts {
    pub read: Duration,
    pub write: Duration,
    pub probe_read: Duration,
    pub probe_write: Duration,
}

impl Default for ClipboardTimeouts {
    fn default() -> Self {
        ClipboardTimeouts {
            read: Duration::from_secs(2),
            write: Duration::from_secs(5),
            probe_read: Duration::from_secs(2),
            probe_write: Duration::from_secs(2),
        }
    }
}

/// Minimal clipboard surface the transport polls and writes.
#[async_trait]
pub trait ClipboardIo: Send + Sync {
    fn name(&self) -> &str;
    async fn read_text(&self) -> Result<String>;
    async fn write_text(&self, text: &str) -> Result<()>;
}

/// Clipboard driven by external reader/writer commands (wl-paste/wl-copy,
/// xclip, xsel).
pub struct CommandClipboard {
    backend_name: String,
    read_cmd: Vec<String>,
    write_cmd: Vec<String>,
    timeouts: ClipboardTimeouts,
}

impl CommandClipboard {
    async fn read_with_timeout(&self, timeout: Duration) -> Result<String> {
        let output = run_with_timeout(&self.read_cmd, None, timeout)
            .await
            .map_err(|err| {
                TransportError::Broken(format!(
                    "clipboard read failed for {}: {err}",
                    self.backend_name
                ))
            })?;
        Ok(output)
    }

    async fn write_with_timeout(&self, text: &str, timeout: Duration) -> Result<()> {
        run_with_timeout(&self.write_cmd, Some(text), timeout)
            .await
            .map_err(|err| {
                TransportError::Broken(format!(
                    "clipboard write failed for {}: {err}",
                    self.backend_name
                ))
            })?;
        Ok(())
    }

    /// Strict viability check: a write followed by a read must round-trip
    /// within the probe timeouts.
    async fn probe_roundtrip(&self) -> Result<()> {
        self.write_with_timeout(PROBE_TEXT, self.timeouts.probe_write)
            .await?;
        let read = self.read_with_timeout(self.timeouts.probe_read).await?;
        if read.trim_end() != PROBE_TEXT {
            return Err(TransportError::Setup(format!(
                "clipboard probe mismatch for {}: wrote {PROBE_TEXT:?}, read {read:?}",
                self.backend_name
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ClipboardIo for CommandClipboard {
    fn name(&self) -> &str {
        &self.backend_name
    }

    async fn read_text(&self) -> Result<String> {
        self.read_with_timeout(self.timeouts.read).await
    }

    async fn write_text(&self, text: &str) -> Result<()> {
        self.write_with_timeout(text, self.timeouts.write).await
    }
}

/// In-memory clipboard shared between peers in one process. Test double for
/// the session scenarios.
#[derive(Default)]
pub struct MemoryClipboard {
    value: std::sync::Mutex<String>,
}

impl MemoryClipboard {
    pub fn shared() -> Arc<MemoryClipboard> {
        Arc::new(MemoryClipboard::default())
    }
}

#[async_trait]
impl ClipboardIo for MemoryClipboard {
    fn name(&self) -> &str {
        "memory"
    }

    async fn read_text(&self) -> Result<String> {
        Ok(self
            .value
            .lock()
            .map_err(|_| TransportError::Broken("memory clipboard poisoned".into()))?
            .clone())
    }

    async fn write_text(&self, text: &str) -> Result<()> {
        *self
            .value
            .lock()
            .map_err(|_| TransportError::Broken("memory clipboard poisoned".into()))? =
            text.to_string();
        Ok(())
    }
}

async fn run_with_timeout(
    cmd: &[String],
    stdin_text: Option<&str>,
    timeout: Duration,
) -> std::result::Result<String, String> {
    let mut command = Command::new(&cmd[0]);
    command
        .args(&cmd[1..])
        .stdin(if stdin_text.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|err| format!("spawn: {err}"))?;
    if let (Some(text), Some(mut stdin)) = (stdin_text, child.stdin.take()) {
        use tokio::io::AsyncWriteExt;
        stdin
            .write_all(text.as_bytes())
            .await
            .map_err(|err| format!("stdin: {err}"))?;
        drop(stdin);
    }

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| format!("timed out after {timeout:?}"))?
        .map_err(|err| format!("wait: {err}"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!(
            "exited with {} ({})",
            output.status,
            stderr.trim()
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Session kind detected from the environment.
fn detect_session_type() -> &'static str {
    let session_type = std::env::var("XDG_SESSION_TYPE").unwrap_or_default();
    let has_wayland = !std::env::var("WAYLAND_DISPLAY").unwrap_or_default().is_empty();
    let has_x11 = !std::env::var("DISPLAY").unwrap_or_default().is_empty();

    match session_type.trim().to_ascii_lowercase().as_str() {
        "wayland" => return "wayland",
        "x11" => return "x11",
        _ => {}
    }
    // Mixed Wayland+X11 (XWAYLAND) resolves to Wayland: the compositor owns
    // the authoritative clipboard.
    if has_wayland {
        "wayland"
    } else if has_x11 {
        "x11"
    } else {
        "unknown"
    }
}

fn candidate_order(choice: BackendChoice, session_type: &str) -> Vec<BackendChoice> {
    match choice {
        BackendChoice::Auto => match session_type {
            "wayland" => vec![BackendChoice::Wayland],
            "x11" => vec![BackendChoice::Xsel, BackendChoice::Xclip],
            _ => vec![
                BackendChoice::Xsel,
                BackendChoice::Wayland,
                BackendChoice::Xclip,
            ],
        },
        fixed => vec![fixed],
    }
}

fn find_in_path(binary: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(binary))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

fn build_candidate(
    choice: BackendChoice,
    timeouts: ClipboardTimeouts,
) -> Option<CommandClipboard> {
    let (name, read_cmd, write_cmd, required): (_, Vec<&str>, Vec<&str>, Vec<&str>) = match choice {
        BackendChoice::Wayland => (
            "wayland-wl-clipboard",
            vec!["wl-paste", "--no-newline"],
            vec!["wl-copy"],
            vec!["wl-paste", "wl-copy"],
        ),
        BackendChoice::Xclip => (
            "xclip",
            vec!["xclip", "-selection", "clipboard", "-o"],
            vec!["xclip", "-selection", "clipboard", "-in", "-silent"],
            vec!["xclip"],
        ),
        BackendChoice::Xsel => (
            "xsel",
            vec!["xsel", "--clipboard", "--output"],
            vec!["xsel", "--clipboard", "--input"],
            vec!["xsel"],
        ),
        BackendChoice::Auto => return None,
    };

    if !required.iter().all(|bin| find_in_path(bin).is_some()) {
        return None;
    }
    Some(CommandClipboard {
        backend_name: name.to_string(),
        read_cmd: read_cmd.into_iter().map(String::from).collect(),
        write_cmd: write_cmd.into_iter().map(String::from).collect(),
        timeouts,
    })
}

fn install_hints() -> &'static str {
    "Install clipboard tools for this environment:\n\
     - Debian/Ubuntu: sudo apt install wl-clipboard xsel xclip\n\
     - Fedora: sudo dnf install wl-clipboard xsel xclip\n\
     - Arch: sudo pacman -S wl-clipboard xsel xclip"
}

/// Pick and probe a clipboard backend. Fatal (setup error) when no backend
/// passes a round-trip, with remediation hints in the message.
pub async fn detect_backend(
    choice: BackendChoice,
    timeouts: ClipboardTimeouts,
) -> Result<Arc<dyn ClipboardIo>> {
    let session_type = detect_session_type();
    let order = candidate_order(choice, session_type);

    let mut failures = Vec::new();
    for candidate_choice in &order {
        let Some(candidate) = build_candidate(*candidate_choice, timeouts) else {
            failures.push(format!("- {candidate_choice:?}: executable not found"));
            continue;
        };
        match candidate.probe_roundtrip().await {
            Ok(()) => {
                tracing::info!(backend = candidate.name(), session = session_type, "clipboard backend selected");
                return Ok(Arc::new(candidate));
            }
            Err(err) => failures.push(format!("- {}: {err}", candidate.name())),
        }
    }

    Err(TransportError::Setup(format!(
        "no viable clipboard backend (session: {session_type})\nattempted:\n{}\n{}",
        failures.join("\n"),
        install_hints()
    )))
}

/// Clipboard polling transport. Link-unreliable: the session layer drives
/// retransmission.
pub struct ClipboardTransport {
    name: String,
    channels: TransportChannels,
}

impl ClipboardTransport {
    pub fn spawn(io: Arc<dyn ClipboardIo>, poll_interval: Duration) -> ClipboardTransport {
        let name = format!("clipboard:{}", io.name());
        let (channels, worker) = channel_pair();
        tokio::spawn(worker_loop(io, worker, poll_interval));
        ClipboardTransport { name, channels }
    }
}

#[async_trait]
impl Transport for ClipboardTransport {
    fn name(&self) -> &str {
        &self.name
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

async fn worker_loop(io: Arc<dyn ClipboardIo>, mut worker: WorkerSide, poll_interval: Duration) {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut last_sent = String::new();
    let mut last_received = String::new();

    loop {
        tokio::select! {
            _ = worker.shutdown_rx.changed() => {
                if worker.is_shutdown() {
                    break;
                }
            }
            outbound = worker.outbound_rx.recv() => {
                let Some(envelope) = outbound else { break };
                match wire::encode_clipboard_line(&envelope) {
                    Ok(line) => {
                        if let Err(err) = io.write_text(&line).await {
                            tracing::warn!(error = %err, "clipboard write failed");
                            worker.mark_broken(err.to_string());
                            break;
                        }
                        last_sent = line;
                        // The clipboard holds one message at a time; give
                        // the peer a chance to observe this one before the
                        // next write overwrites it.
                        tokio::time::sleep(poll_interval * 2).await;
                    }
                    Err(err) => tracing::debug!(error = %err, "dropping unencodable envelope"),
                }
            }
            _ = ticker.tick() => {
                let text = match io.read_text().await {
                    Ok(text) => text,
                    Err(err) => {
                        tracing::warn!(error = %err, "clipboard read failed");
                        worker.mark_broken(err.to_string());
                        break;
                    }
                };
                let trimmed = text.trim_end().to_string();
                if trimmed.is_empty() || trimmed == last_sent || trimmed == last_received {
                    continue;
                }
                last_received = trimmed.clone();
                match wire::decode_clipboard_line(&trimmed) {
                    Ok(envelope) => {
                        if !worker.deliver(envelope).await {
                            break;
                        }
                    }
                    // Someone else's clipboard content, or a torn write.
                    Err(err) => tracing::trace!(error = %err, "ignoring clipboard content"),
                }
            }
        }
    }

    // Flush whatever the session queued before shutdown.
    let deadline = tokio::time::Instant::now() + crate::DRAIN_DEADLINE;
    while let Ok(envelope) = worker.outbound_rx.try_recv() {
        if tokio::time::Instant::now() >= deadline {
            break;
        }
        if let Ok(line) = wire::encode_clipboard_line(&envelope) {
            if io.write_text(&line).await.is_err() {
                break;
            }
            tokio::time::sleep(poll_interval * 2).await;
        }
    }
}
