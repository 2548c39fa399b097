//! USB-serial framed transport.
//!
//! Envelope JSON rides in COBS/marker link frames (see `clipssh-link`) with
//! link-layer ACK/retry, so the session layer treats this medium as
//! reliable. The fd is driven by a dedicated OS thread: serial I/O is
//! blocking by nature and the frame codec plus retry table are synchronous
//! state machines.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsFd, OwnedFd};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::termios::{self, ControlFlags, SetArg, SpecialCharacterIndices};

use clipssh_link::{Deframer, FrameCodec, LinkError, LinkReliability, ReliabilityConfig};
use clipssh_protocol::Envelope;

use crate::facade::{channel_pair, TransportChannels, WorkerSide};
use crate::{Result, Transport, TransportError};

pub const DEFAULT_BAUD_RATE: u32 = 115_200;

#[derive(Debug, Clone)]
pub struct SerialTransportConfig {
    pub port: PathBuf,
    pub baud_rate: u32,
    pub marker_run: usize,
    pub ack_timeout: Duration,
    pub max_retries: u32,
}

impl Default for SerialTransportConfig {
    fn default() -> Self {
        SerialTransportConfig {
            port: PathBuf::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            marker_run: clipssh_link::SERIAL_MARKER_RUN,
            ack_timeout: Duration::from_millis(200),
            max_retries: 20,
        }
    }
}

pub struct SerialTransport {
    name: String,
    channels: TransportChannels,
}

impl SerialTransport {
    /// Open the configured serial port (8N1, raw, non-blocking) and start
    /// the I/O thread.
    pub fn spawn(config: SerialTransportConfig) -> Result<SerialTransport> {
        let file = open_serial_port(&config)?;
        let name = format!("usb-serial:{}", config.port.display());
        Self::spawn_on_file(file, config, name)
    }

    /// Run the framed link over an already-open full-duplex fd. Used by
    /// tests (socket pairs) and USB gadget setups that hand us an fd.
    pub fn spawn_on_file(
        file: File,
        config: SerialTransportConfig,
        name: String,
    ) -> Result<SerialTransport> {
        let (channels, worker) = channel_pair();
        std::thread::Builder::new()
            .name("clipssh-serial-io".to_string())
            .spawn(move || io_thread(file, worker, config))
            .map_err(|err| TransportError::Setup(format!("spawn serial io thread: {err}")))?;
        Ok(SerialTransport { name, channels })
    }
}

#[async_trait]
impl Transport for SerialTransport {
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

fn open_serial_port(config: &SerialTransportConfig) -> Result<File> {
    use std::os::unix::fs::OpenOptionsExt;

    let flags = nix::fcntl::OFlag::O_NOCTTY | nix::fcntl::OFlag::O_NONBLOCK;
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(flags.bits())
        .open(&config.port)
        .map_err(|err| {
            TransportError::Setup(format!(
                "failed to open serial port {}: {err}",
                config.port.display()
            ))
        })?;

    configure_tty(&file, config.baud_rate)?;
    Ok(file)
}

/// Raw 8N1 with VMIN=0/VTIME=0. Skipped silently for fds that are not
/// terminals (test pipes and socket pairs).
fn configure_tty(file: &File, baud_rate: u32) -> Result<()> {
    let mut attrs = match termios::tcgetattr(file.as_fd()) {
        Ok(attrs) => attrs,
        Err(_) => return Ok(()),
    };

    termios::cfmakeraw(&mut attrs);
    attrs.control_flags |= ControlFlags::CLOCAL | ControlFlags::CREAD;
    attrs.control_flags &= !(ControlFlags::PARENB | ControlFlags::CSTOPB);
    attrs.control_flags &= !ControlFlags::CSIZE;
    attrs.control_flags |= ControlFlags::CS8;
    attrs.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
    attrs.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;

    if let Some(baud) = baud_constant(baud_rate) {
        termios::cfsetspeed(&mut attrs, baud)
            .map_err(|err| TransportError::Setup(format!("set serial speed: {err}")))?;
    }
    termios::tcsetattr(file.as_fd(), SetArg::TCSANOW, &attrs)
        .map_err(|err| TransportError::Setup(format!("configure serial tty: {err}")))?;
    Ok(())
}

fn baud_constant(rate: u32) -> Option<termios::BaudRate> {
    use termios::BaudRate;
    match rate {
        9_600 => Some(BaudRate::B9600),
        19_200 => Some(BaudRate::B19200),
        38_400 => Some(BaudRate::B38400),
        57_600 => Some(BaudRate::B57600),
        115_200 => Some(BaudRate::B115200),
        230_400 => Some(BaudRate::B230400),
        460_800 => Some(BaudRate::B460800),
        921_600 => Some(BaudRate::B921600),
        1_000_000 => Some(BaudRate::B1000000),
        2_000_000 => Some(BaudRate::B2000000),
        3_000_000 => Some(BaudRate::B3000000),
        _ => None,
    }
}

fn io_thread(mut file: File, mut worker: WorkerSide, config: SerialTransportConfig) {
    let codec = FrameCodec::new(config.marker_run);
    let mut deframer = Deframer::new();
    let mut reliability = LinkReliability::new(ReliabilityConfig {
        ack_timeout: config.ack_timeout,
        max_retries: config.max_retries,
        ..ReliabilityConfig::default()
    });
    let mut write_backlog: VecDeque<Vec<u8>> = VecDeque::new();
    let mut read_buf = [0u8; 4096];

    loop {
        // A dropped facade (has_changed error) counts as shutdown too.
        if *worker.shutdown_rx.borrow() || worker.shutdown_rx.has_changed().is_err() {
            break;
        }

        wait_readable(&file, Duration::from_millis(5));

        // Bounded read burst keeps the loop responsive under heavy input.
        let mut medium_dead = None;
        for _ in 0..32 {
            match file.read(&mut read_buf) {
                Ok(0) => {
                    medium_dead = Some("serial fd closed".to_string());
                    break;
                }
                Ok(n) => {
                    for frame in deframer.feed(&read_buf[..n]) {
                        for payload in reliability.handle_inbound(frame) {
                            handle_payload(&mut worker, &payload);
                        }
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    medium_dead = Some(format!("serial read failed: {err}"));
                    break;
                }
            }
        }
        if let Some(reason) = medium_dead {
            worker.mark_broken(reason);
            return;
        }

        // Stage whatever the session queued.
        while let Ok(envelope) = worker.outbound_rx.try_recv() {
            match envelope.to_json() {
                Ok(json) => {
                    reliability.stage_data(json.into_bytes());
                }
                Err(err) => tracing::debug!(error = %err, "dropping unencodable envelope"),
            }
        }

        match reliability.due_frames(Instant::now()) {
            Ok(frames) => {
                for frame in frames {
                    match codec.encode(&frame) {
                        Ok(bytes) => write_backlog.push_back(bytes),
                        Err(err) => tracing::debug!(error = %err, "dropping oversized frame"),
                    }
                }
            }
            Err(LinkError::RetryExhausted { frame_seq, attempts, .. }) => {
                worker.mark_broken(format!(
                    "frame seq={frame_seq} unacknowledged after {attempts} transmissions"
                ));
                return;
            }
            Err(err) => {
                worker.mark_broken(err.to_string());
                return;
            }
        }

        if let Err(reason) = flush_backlog(&mut file, &mut write_backlog) {
            worker.mark_broken(reason);
            return;
        }
    }

    // Shutdown: push any final frames out with a bounded deadline.
    let deadline = Instant::now() + crate::DRAIN_DEADLINE;
    while let Ok(envelope) = worker.outbound_rx.try_recv() {
        if let Ok(json) = envelope.to_json() {
            reliability.stage_data(json.into_bytes());
        }
    }
    if let Ok(frames) = reliability.due_frames(Instant::now()) {
        for frame in frames {
            if let Ok(bytes) = codec.encode(&frame) {
                write_backlog.push_back(bytes);
            }
        }
    }
    while !write_backlog.is_empty() && Instant::now() < deadline {
        if flush_backlog(&mut file, &mut write_backlog).is_err() {
            break;
        }
        if !write_backlog.is_empty() {
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

fn handle_payload(worker: &mut WorkerSide, payload: &[u8]) {
    let text = match std::str::from_utf8(payload) {
        Ok(text) => text,
        Err(err) => {
            tracing::debug!(error = %err, "non-utf8 link payload dropped");
            return;
        }
    };
    match Envelope::from_json(text) {
        Ok(envelope) => {
            let _ = worker.deliver_blocking(envelope);
        }
        Err(err) => tracing::debug!(error = %err, "undecodable link payload dropped"),
    }
}

fn wait_readable(file: &File, timeout: Duration) -> bool {
    let mut fds = [PollFd::new(file.as_fd(), PollFlags::POLLIN)];
    let millis = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
    match poll(&mut fds, PollTimeout::from(millis)) {
        Ok(n) => n > 0,
        Err(_) => false,
    }
}

fn flush_backlog(
    file: &mut File,
    backlog: &mut VecDeque<Vec<u8>>,
) -> std::result::Result<(), String> {
    while let Some(front) = backlog.front_mut() {
        match file.write(front) {
            Ok(written) if written >= front.len() => {
                backlog.pop_front();
            }
            Ok(written) => {
                front.drain(..written);
                return Ok(()); // kernel buffer full, come back later
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(format!("serial write failed: {err}")),
        }
    }
    Ok(())
}

/// Allow building test transports over arbitrary fds (socket pairs).
pub fn file_from_owned_fd(fd: OwnedFd) -> File {
    File::from(fd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clipssh_link::LinkFrame;
    use clipssh_protocol::{Body, Protocol, Role};
    use std::os::unix::net::UnixStream;

    fn transport_pair() -> (SerialTransport, SerialTransport) {
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();
        let config = SerialTransportConfig {
            ack_timeout: Duration::from_millis(50),
            ..SerialTransportConfig::default()
        };
        let ta = SerialTransport::spawn_on_file(
            file_from_owned_fd(OwnedFd::from(a)),
            config.clone(),
            "usb-serial:test-a".into(),
        )
        .unwrap();
        let tb = SerialTransport::spawn_on_file(
            file_from_owned_fd(OwnedFd::from(b)),
            config,
            "usb-serial:test-b".into(),
        )
        .unwrap();
        (ta, tb)
    }

    fn envelope(seq: u64) -> Envelope {
        Envelope::new(
            Protocol::GitsshV2,
            uuid::Uuid::new_v4().to_string(),
            Role::Client,
            seq,
            Body::PtyInput {
                data: format!("input-{seq}\n").into_bytes(),
            },
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn envelopes_cross_the_link_in_order() {
        let (a, b) = transport_pair();

        let first = envelope(0);
        let second = envelope(1);
        a.send(first.clone()).await.unwrap();
        a.send(second.clone()).await.unwrap();

        assert_eq!(
            b.recv(Duration::from_secs(3)).await.unwrap(),
            Some(first)
        );
        assert_eq!(
            b.recv(Duration::from_secs(3)).await.unwrap(),
            Some(second)
        );

        a.close().await;
        b.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn duplicate_data_frames_deliver_once_and_are_reacked() {
        let (raw, peer) = UnixStream::pair().unwrap();
        peer.set_nonblocking(true).unwrap();
        let config = SerialTransportConfig::default();
        let transport = SerialTransport::spawn_on_file(
            file_from_owned_fd(OwnedFd::from(peer)),
            config.clone(),
            "usb-serial:test".into(),
        )
        .unwrap();

        // Hand-frame the same DATA frame twice, as if the first ACK was
        // lost and the peer retransmitted.
        let sent = envelope(0);
        let codec = FrameCodec::new(config.marker_run);
        let frame = LinkFrame::Data {
            frame_seq: 1,
            payload: sent.to_json().unwrap().into_bytes(),
        };
        let bytes = codec.encode(&frame).unwrap();
        let mut raw_blocking = raw;
        raw_blocking.set_nonblocking(false).unwrap();
        raw_blocking.write_all(&bytes).unwrap();
        raw_blocking.write_all(&bytes).unwrap();

        assert_eq!(
            transport.recv(Duration::from_secs(3)).await.unwrap(),
            Some(sent)
        );
        assert_eq!(
            transport.recv(Duration::from_millis(200)).await.unwrap(),
            None
        );

        // Both copies must have been acknowledged.
        raw_blocking
            .set_read_timeout(Some(Duration::from_secs(3)))
            .unwrap();
        let mut deframer = Deframer::new();
        let mut acks = Vec::new();
        let mut buf = [0u8; 1024];
        while acks.len() < 2 {
            let n = raw_blocking.read(&mut buf).unwrap();
            assert!(n > 0, "peer closed before acking");
            for decoded in deframer.feed(&buf[..n]) {
                match decoded {
                    LinkFrame::Ack { frame_seq } => {
                        assert_eq!(frame_seq, 1);
                        acks.push(frame_seq);
                    }
                    other => panic!("unexpected frame {other:?}"),
                }
            }
        }

        transport.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn peer_disappearing_breaks_the_transport() {
        let (a, b) = transport_pair();
        drop(b);

        // The sender keeps retrying until its budget runs out, then the
        // transport reports broken.
        a.send(envelope(0)).await.unwrap();
        let mut saw_broken = false;
        for _ in 0..200 {
            match a.recv(Duration::from_millis(100)).await {
                Ok(None) => continue,
                Ok(Some(_)) => continue,
                Err(TransportError::Broken(_)) | Err(TransportError::Closed) => {
                    saw_broken = true;
                    break;
                }
                Err(other) => panic!("unexpected error {other:?}"),
            }
        }
        assert!(saw_broken);
    }

    #[test]
    fn unknown_baud_rates_fall_back_to_no_speed_change() {
        assert!(baud_constant(115_200).is_some());
        assert!(baud_constant(123_456).is_none());
    }
}
