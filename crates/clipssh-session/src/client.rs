//! Client side: handshake, command execution (CLIPSSH/1) and the
//! interactive PTY event stream (gitssh/2).

use std::sync::Arc;
use std::time::{Duration, Instant};

use clipssh_protocol::{Body, Envelope, Protocol, Role, SeqGen, SignalName, MAX_CHUNK_BYTES};
use clipssh_transport::Transport;

use crate::reorder::ReorderBuffer;
use crate::retry::RetryQueue;
use crate::{Result, SessionError};

/// What the server told us about itself in the connect_ack.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub user: String,
    pub host: String,
    pub cwd: String,
    pub cols: u16,
    pub rows: u16,
}

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
}

/// Session-visible happenings on the inbound path.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    PtyOutput(Vec<u8>),
    PtyClosed { exit_status: i32 },
    Stdout { cmd_id: String, data: Vec<u8> },
    Stderr { cmd_id: String, data: Vec<u8> },
    Exit { cmd_id: String, code: i32 },
    PeerError { code: String, message: String },
    Disconnected,
}

pub struct ClientSession {
    transport: Arc<dyn Transport>,
    protocol: Protocol,
    link_reliable: bool,
    session_id: String,
    server: ServerInfo,
    seq: SeqGen,
    retry: RetryQueue,
    reorder: Option<ReorderBuffer>,
    /// Events already decoded but not yet handed to the caller (a reorder
    /// gap fill can release several envelopes at once).
    pending: std::collections::VecDeque<SessionEvent>,
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("session_id", &self.session_id)
            .field("server", &self.server)
            .finish()
    }
}

impl ClientSession {
    /// Run the handshake: retransmit connect_req until the server answers.
    pub async fn connect(
        transport: Arc<dyn Transport>,
        protocol: Protocol,
        host: &str,
        timeout: Duration,
    ) -> Result<ClientSession> {
        let link_reliable = transport.link_reliable();
        let mut seq = SeqGen::new();
        let request = Envelope::new(
            protocol,
            "",
            Role::Client,
            seq.next(),
            Body::ConnectReq {
                host: host.to_string(),
            },
        );

        let deadline = Instant::now() + timeout;
        let retry_interval = Duration::from_millis(500);
        let mut next_send = Instant::now();

        while Instant::now() < deadline {
            if Instant::now() >= next_send {
                tracing::debug!(msg_id = %request.msg_id, "sending connect_req");
                transport.send(request.clone()).await?;
                next_send = Instant::now() + retry_interval;
                if link_reliable {
                    // The link layer guarantees delivery; one send is enough.
                    next_send = deadline;
                }
            }

            let wait = next_send
                .saturating_duration_since(Instant::now())
                .min(Duration::from_millis(250));
            let Some(envelope) = transport.recv(wait).await? else {
                continue;
            };
            if envelope.target != Role::Client || envelope.source != Role::Server {
                continue;
            }
            match envelope.body {
                Body::ConnectAck {
                    session_id,
                    user,
                    host,
                    cwd,
                    cols,
                    rows,
                } => {
                    tracing::info!(session_id = %session_id, user, host, "connected");
                    let mut reorder = (!link_reliable).then(ReorderBuffer::default);
                    if let Some(reorder) = reorder.as_mut() {
                        // The server's seqs up to the ack are consumed.
                        reorder.prime(envelope.seq + 1);
                    }
                    return Ok(ClientSession {
                        transport,
                        protocol,
                        link_reliable,
                        session_id,
                        server: ServerInfo {
                            user,
                            host,
                            cwd,
                            cols,
                            rows,
                        },
                        seq,
                        retry: RetryQueue::new(),
                        reorder,
                        pending: std::collections::VecDeque::new(),
                    });
                }
                Body::Busy { session_id } => {
                    return Err(SessionError::Busy { session_id });
                }
                Body::Error { code, message } => {
                    return Err(SessionError::Peer { code, message });
                }
                _ => continue,
            }
        }
        Err(SessionError::Timeout("connect_ack"))
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn server(&self) -> &ServerInfo {
        &self.server
    }

    /// A short shell-style prompt built from the handshake fields.
    pub fn prompt(&self) -> String {
        format!("{}@{}:{}> ", self.server.user, self.server.host, self.server.cwd)
    }

    /// Send a body on this session; polled transports also queue it for
    /// retransmission.
    pub async fn send_body(&mut self, body: Body) -> Result<Envelope> {
        let envelope = Envelope::new(
            self.protocol,
            self.session_id.clone(),
            Role::Client,
            self.seq.next(),
            body,
        );
        self.transport.send(envelope.clone()).await?;
        if !self.link_reliable {
            self.retry.enqueue(envelope.clone(), Instant::now());
        }
        Ok(envelope)
    }

    /// Send terminal bytes as pty_input, chunked and flushed immediately.
    pub async fn send_input(&mut self, data: &[u8]) -> Result<()> {
        for chunk in data.chunks(MAX_CHUNK_BYTES) {
            self.send_body(Body::PtyInput {
                data: chunk.to_vec(),
            })
            .await?;
        }
        Ok(())
    }

    pub async fn resize(&mut self, cols: u16, rows: u16) -> Result<()> {
        self.send_body(Body::PtyResize { cols, rows }).await?;
        Ok(())
    }

    pub async fn signal(&mut self, name: SignalName) -> Result<()> {
        self.send_body(Body::PtySignal { name }).await?;
        Ok(())
    }

    /// Wait up to `timeout` for the next session event, driving the retry
    /// schedule while idle. `Ok(None)` means nothing arrived in time.
    pub async fn next_event(&mut self, timeout: Duration) -> Result<Option<SessionEvent>> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }
            let (retransmit, expired) = self.retry.due(Instant::now());
            for envelope in retransmit {
                tracing::trace!(msg_id = %envelope.msg_id, kind = envelope.kind(), "retransmitting");
                self.transport.send(envelope).await?;
            }
            if let Some(envelope) = expired.into_iter().next() {
                return Err(SessionError::Timeout(match envelope.body {
                    Body::Cmd { .. } => "command reply",
                    _ => "peer acknowledgement",
                }));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let wait = remaining.min(Duration::from_millis(250));
            let Some(envelope) = self.transport.recv(wait).await? else {
                if Instant::now() >= deadline {
                    return Ok(None);
                }
                continue;
            };
            if envelope.target != Role::Client
                || envelope.source != Role::Server
                || envelope.session_id != self.session_id
            {
                continue;
            }
            self.retry.observe_peer(&envelope);

            let deliverable = match self.reorder.as_mut() {
                Some(reorder) => reorder.push(envelope),
                None => vec![envelope],
            };
            for envelope in deliverable {
                if let Some(event) = map_event(envelope) {
                    self.pending.push_back(event);
                }
            }
        }
    }

    /// CLIPSSH/1: run one command and collect its streamed reply.
    pub async fn execute(&mut self, text: &str, timeout: Duration) -> Result<CommandResult> {
        let cmd = self
            .send_body(Body::Cmd {
                text: text.to_string(),
            })
            .await?;
        let cmd_id = cmd.msg_id;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(SessionError::Timeout("command reply"));
            }
            match self.next_event(remaining).await? {
                Some(SessionEvent::Stdout { cmd_id: reply_id, data }) if reply_id == cmd_id => {
                    stdout.extend_from_slice(&data);
                }
                Some(SessionEvent::Stderr { cmd_id: reply_id, data }) if reply_id == cmd_id => {
                    stderr.extend_from_slice(&data);
                }
                Some(SessionEvent::Exit { cmd_id: reply_id, code }) if reply_id == cmd_id => {
                    return Ok(CommandResult {
                        stdout,
                        stderr,
                        exit_code: code,
                    });
                }
                Some(SessionEvent::PeerError { code, message }) => {
                    return Err(SessionError::Peer { code, message });
                }
                Some(SessionEvent::Disconnected) => return Err(SessionError::Disconnected),
                Some(_) | None => continue,
            }
        }
    }

    pub async fn disconnect(mut self) -> Result<()> {
        let _ = self.send_body(Body::Disconnect {}).await;
        self.transport.close().await;
        Ok(())
    }
}

fn map_event(envelope: Envelope) -> Option<SessionEvent> {
    match envelope.body {
        Body::PtyOutput { data } => Some(SessionEvent::PtyOutput(data)),
        Body::PtyClosed { exit_status } => Some(SessionEvent::PtyClosed { exit_status }),
        Body::Stdout { cmd_id, data } => Some(SessionEvent::Stdout { cmd_id, data }),
        Body::Stderr { cmd_id, data } => Some(SessionEvent::Stderr { cmd_id, data }),
        Body::Exit { cmd_id, code } => Some(SessionEvent::Exit { cmd_id, code }),
        Body::Error { code, message } => Some(SessionEvent::PeerError { code, message }),
        Body::Disconnect {} => Some(SessionEvent::Disconnected),
        // connect_ack retransmits and anything client-irrelevant.
        _ => None,
    }
}
