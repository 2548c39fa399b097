//! Shared plumbing for the clipssh binaries: flag groups, transport
//! construction, logging setup and terminal helpers.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, ValueEnum};

use clipssh_modem::Modulation;
use clipssh_protocol::Role;
use clipssh_transport::audio::{AudioModemConfig, AudioModemTransport, DiagConfig};
use clipssh_transport::audio_io::{AudioIo, PipeWireConfig, PipeWireIo, PulseAudioIo, WavCaptureIo};
use clipssh_transport::clipboard::{
    detect_backend, BackendChoice, ClipboardTimeouts, ClipboardTransport, POLL_INTERVAL,
};
use clipssh_transport::drive::{expand_home, DriveTransport, DriveTransportConfig, DEFAULT_TOKEN_PATH};
use clipssh_transport::git::{GitTransport, GitTransportConfig};
use clipssh_transport::serial::{SerialTransport, SerialTransportConfig};
use clipssh_transport::Transport;

pub const EXIT_OK: i32 = 0;
pub const EXIT_TRANSPORT: i32 = 1;
pub const EXIT_SHELL: i32 = 2;
pub const EXIT_INTERRUPT: i32 = 130;

/// Default handshake patience for the slow polled media.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

pub fn init_tracing(binary: &str, verbose: bool) {
    let default_directive = if verbose {
        format!("{binary}=debug,clipssh=debug")
    } else {
        format!("{binary}=info,clipssh=info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_directive.into()),
        )
        .with_writer(std::io::stderr)
        .init();
}

// --- clipboard flag group (sshc / sshcd) ---

#[derive(Args, Debug, Clone)]
pub struct ClipboardArgs {
    /// Clipboard backend to use.
    #[arg(long = "clipboard-backend", default_value = "auto")]
    pub clipboard_backend: String,

    /// Steady-state clipboard read timeout, seconds.
    #[arg(long = "clipboard-read-timeout", default_value_t = 2.0)]
    pub clipboard_read_timeout: f64,

    /// Steady-state clipboard write timeout, seconds.
    #[arg(long = "clipboard-write-timeout", default_value_t = 5.0)]
    pub clipboard_write_timeout: f64,

    /// Read timeout used only while probing backends, seconds.
    #[arg(long = "clipboard-probe-read-timeout", default_value_t = 2.0)]
    pub clipboard_probe_read_timeout: f64,

    /// Write timeout used only while probing backends, seconds.
    #[arg(long = "clipboard-probe-write-timeout", default_value_t = 2.0)]
    pub clipboard_probe_write_timeout: f64,
}

impl ClipboardArgs {
    pub async fn build_transport(&self) -> Result<Arc<dyn Transport>> {
        let choice = BackendChoice::parse(&self.clipboard_backend)
            .context("invalid --clipboard-backend")?;
        let timeouts = ClipboardTimeouts {
            read: secs(self.clipboard_read_timeout),
            write: secs(self.clipboard_write_timeout),
            probe_read: secs(self.clipboard_probe_read_timeout),
            probe_write: secs(self.clipboard_probe_write_timeout),
        };
        let io = detect_backend(choice, timeouts)
            .await
            .context("clipboard backend selection failed")?;
        Ok(Arc::new(ClipboardTransport::spawn(io, POLL_INTERVAL)))
    }
}

fn secs(value: f64) -> Duration {
    Duration::from_secs_f64(value.max(0.1))
}

// --- gitssh transport flag group (sshg / sshgd) ---

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Git,
    GoogleDrive,
    UsbSerial,
    AudioModem,
}

impl TransportKind {
    /// Whether a failed medium should be re-opened with backoff rather than
    /// surfaced to the user.
    pub fn reopens_on_failure(&self) -> bool {
        matches!(self, TransportKind::Git | TransportKind::GoogleDrive)
    }
}

#[derive(Args, Debug, Clone)]
pub struct GitsshTransportArgs {
    /// Side channel carrying the session.
    #[arg(long, value_enum, default_value = "git")]
    pub transport: TransportKind,

    /// Shared upstream bare repository (git transport).
    #[arg(long = "upstream-url", default_value = "/tmp/gitssh-upstream.git")]
    pub upstream_url: String,

    /// Local bare mirror path (git transport).
    #[arg(long = "local-repo")]
    pub local_repo: Option<PathBuf>,

    /// OAuth desktop-app client secrets file (google-drive transport).
    #[arg(long = "drive-client-secrets")]
    pub drive_client_secrets: Option<PathBuf>,

    /// Where the OAuth refresh token is persisted (google-drive transport).
    #[arg(long = "drive-token-path", default_value = DEFAULT_TOKEN_PATH)]
    pub drive_token_path: String,

    /// Serial device path (usb-serial transport).
    #[arg(long = "serial-port")]
    pub serial_port: Option<PathBuf>,

    /// Serial baud rate (usb-serial transport).
    #[arg(long = "baud-rate", default_value_t = clipssh_transport::serial::DEFAULT_BAUD_RATE)]
    pub baud_rate: u32,

    /// Modulation profile for the audio modem.
    #[arg(long = "audio-modulation", default_value = "auto")]
    pub audio_modulation: String,

    /// Byte-level FEC repeat factor for the audio modem.
    #[arg(long = "audio-byte-repeat", default_value_t = 3)]
    pub audio_byte_repeat: usize,

    /// Link ACK timeout for the audio modem, milliseconds.
    #[arg(long = "audio-ack-timeout-ms", default_value_t = 800)]
    pub audio_ack_timeout_ms: u64,

    /// Link retransmission budget for the audio modem.
    #[arg(long = "audio-max-retries", default_value_t = 32)]
    pub audio_max_retries: u32,

    /// Zero-byte marker run length for audio frames.
    #[arg(long = "audio-marker-run", default_value_t = clipssh_link::AUDIO_MARKER_RUN)]
    pub audio_marker_run: usize,

    /// PipeWire capture node id.
    #[arg(long = "pw-capture-node-id")]
    pub pw_capture_node_id: Option<u32>,

    /// Regex matched against PipeWire node names to pick the capture node.
    #[arg(long = "pw-capture-match")]
    pub pw_capture_match: Option<String>,

    /// PipeWire playback node id.
    #[arg(long = "pw-write-node-id")]
    pub pw_write_node_id: Option<u32>,

    /// Regex matched against PipeWire node names to pick the playback node.
    #[arg(long = "pw-write-match")]
    pub pw_write_match: Option<String>,

    /// Replay a PCM16 WAV file instead of live capture.
    #[arg(long = "pw-capture-wav-path")]
    pub pw_capture_wav_path: Option<PathBuf>,

    /// Skip the PipeWire session-manager/port preflight.
    #[arg(long = "skip-pw-preflight")]
    pub skip_pw_preflight: bool,

    /// Emit diagnostics pings on the audio link even when idle.
    #[arg(long, short = 'd')]
    pub diag: bool,

    /// Interval between diagnostics pings, milliseconds.
    #[arg(long = "diag-interval-ms", default_value_t = 1000)]
    pub diag_interval_ms: u64,

    /// Diagnostics pings burst on client connect.
    #[arg(long = "diag-connect-burst", default_value_t = 4)]
    pub diag_connect_burst: u32,
}

impl GitsshTransportArgs {
    pub async fn build_transport(&self, role: Role) -> Result<Arc<dyn Transport>> {
        match self.transport {
            TransportKind::Git => {
                let default_mirror = match role {
                    Role::Client => PathBuf::from("/tmp/gitssh-client.git"),
                    Role::Server => PathBuf::from("/tmp/gitssh-server.git"),
                };
                let local_repo = self.local_repo.clone().unwrap_or(default_mirror);
                let config = match role {
                    Role::Client => {
                        GitTransportConfig::for_client(local_repo, self.upstream_url.clone())
                    }
                    Role::Server => {
                        GitTransportConfig::for_server(local_repo, self.upstream_url.clone())
                    }
                };
                Ok(Arc::new(
                    GitTransport::spawn(config)
                        .await
                        .context("git transport setup failed")?,
                ))
            }
            TransportKind::GoogleDrive => {
                let secrets = self
                    .drive_client_secrets
                    .clone()
                    .context("--drive-client-secrets is required for --transport google-drive")?;
                let token_path = expand_home(&self.drive_token_path);
                let config = match role {
                    Role::Client => DriveTransportConfig::for_client(secrets, token_path),
                    Role::Server => DriveTransportConfig::for_server(secrets, token_path),
                };
                Ok(Arc::new(
                    DriveTransport::spawn(config)
                        .await
                        .context("google-drive transport setup failed")?,
                ))
            }
            TransportKind::UsbSerial => {
                let port = self
                    .serial_port
                    .clone()
                    .context("--serial-port is required for --transport usb-serial")?;
                let config = SerialTransportConfig {
                    port,
                    baud_rate: self.baud_rate,
                    ..SerialTransportConfig::default()
                };
                Ok(Arc::new(
                    SerialTransport::spawn(config).context("serial transport setup failed")?,
                ))
            }
            TransportKind::AudioModem => {
                let io = self.build_audio_io(role).await?;
                let config = AudioModemConfig {
                    modulation: Modulation::parse(&self.audio_modulation)
                        .context("invalid --audio-modulation")?,
                    byte_repeat: self.audio_byte_repeat.max(1),
                    marker_run: self.audio_marker_run.max(4),
                    ack_timeout: Duration::from_millis(self.audio_ack_timeout_ms.max(10)),
                    max_retries: self.audio_max_retries.max(1),
                    diag: DiagConfig {
                        enabled: self.diag,
                        interval: Duration::from_millis(self.diag_interval_ms.max(50)),
                        connect_burst: self.diag_connect_burst,
                    },
                    ..AudioModemConfig::default()
                };
                Ok(Arc::new(AudioModemTransport::spawn(io, config)))
            }
        }
    }

    async fn build_audio_io(&self, role: Role) -> Result<Box<dyn AudioIo>> {
        if let Some(wav_path) = &self.pw_capture_wav_path {
            return Ok(Box::new(
                WavCaptureIo::open(wav_path.clone()).context("WAV capture setup failed")?,
            ));
        }
        match role {
            // The daemon side drives PulseAudio against default devices.
            Role::Server => Ok(Box::new(
                PulseAudioIo::spawn().context("PulseAudio setup failed")?,
            )),
            // The client side picks PipeWire nodes explicitly.
            Role::Client => Ok(Box::new(
                PipeWireIo::spawn(PipeWireConfig {
                    capture_node_id: self.pw_capture_node_id,
                    capture_match: self.pw_capture_match.clone(),
                    write_node_id: self.pw_write_node_id,
                    write_match: self.pw_write_match.clone(),
                    skip_preflight: self.skip_pw_preflight,
                })
                .await
                .context("PipeWire setup failed")?,
            )),
        }
    }
}

// --- terminal raw mode ---

/// Puts stdin into raw mode for the lifetime of the guard; a no-op when
/// stdin is not a terminal.
pub struct RawModeGuard {
    saved: Option<nix::sys::termios::Termios>,
}

impl RawModeGuard {
    pub fn enable() -> RawModeGuard {
        use nix::sys::termios::{cfmakeraw, tcgetattr, tcsetattr, SetArg};
        let stdin = std::io::stdin();
        let saved = match tcgetattr(&stdin) {
            Ok(saved) => {
                let mut raw = saved.clone();
                cfmakeraw(&mut raw);
                match tcsetattr(&stdin, SetArg::TCSANOW, &raw) {
                    Ok(()) => Some(saved),
                    Err(_) => None,
                }
            }
            Err(_) => None,
        };
        RawModeGuard { saved }
    }

    pub fn is_raw(&self) -> bool {
        self.saved.is_some()
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Some(saved) = &self.saved {
            use nix::sys::termios::{tcsetattr, SetArg};
            let _ = tcsetattr(&std::io::stdin(), SetArg::TCSANOW, saved);
        }
    }
}

/// Local terminal size from the environment, when the wrapper exports it.
pub fn local_terminal_size() -> Option<(u16, u16)> {
    let cols = std::env::var("COLUMNS").ok()?.parse().ok()?;
    let rows = std::env::var("LINES").ok()?.parse().ok()?;
    Some((cols, rows))
}
