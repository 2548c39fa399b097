//! Server side: accepts at most one session at a time and bridges it to a
//! shell (interactive PTY for gitssh/2, one-shot command execution for
//! CLIPSSH/1).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use clipssh_protocol::{Body, Envelope, Protocol, Role, SeqGen, MAX_CHUNK_BYTES};
use clipssh_transport::Transport;

use crate::pty::{resolve_shell, PtyEvent, PtyShell};
use crate::reorder::ReorderBuffer;
use crate::retry::RetryQueue;
use crate::{Result, SessionError};

const PTY_EVENT_QUEUE: usize = 256;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub protocol: Protocol,
    pub preferred_shell: String,
    pub command_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            protocol: Protocol::GitsshV2,
            preferred_shell: "tcsh".to_string(),
            command_timeout: Duration::from_secs(120),
        }
    }
}

struct ActiveSession {
    session_id: String,
    connect_msg_id: String,
    seq: SeqGen,
    shell_path: PathBuf,
    pty: Option<PtyShell>,
    pty_events: Option<mpsc::Receiver<PtyEvent>>,
    reorder: Option<ReorderBuffer>,
}

/// Serve sessions until shutdown is signalled or the transport dies.
pub async fn run_server(
    transport: Arc<dyn Transport>,
    config: ServerConfig,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let link_reliable = transport.link_reliable();
    let mut retry = RetryQueue::new();
    let mut active: Option<ActiveSession> = None;
    let mut ticker = tokio::time::interval(Duration::from_millis(250));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    tracing::info!(transport = transport.name(), protocol = config.protocol.as_str(), "server ready");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            incoming = transport.recv(Duration::from_millis(250)) => {
                match incoming {
                    Ok(Some(envelope)) => {
                        retry.observe_peer(&envelope);
                        handle_envelope(
                            &transport,
                            &config,
                            link_reliable,
                            &mut retry,
                            &mut active,
                            envelope,
                        )
                        .await?;
                    }
                    Ok(None) => {}
                    Err(err) => {
                        tracing::warn!(error = %err, "transport failed");
                        close_session(&mut active);
                        return Err(err.into());
                    }
                }
            }
            event = next_pty_event(&mut active) => {
                handle_pty_event(&transport, link_reliable, &mut retry, &mut active, event).await?;
            }
            _ = ticker.tick() => {
                let (retransmit, expired) = retry.due(Instant::now());
                for envelope in retransmit {
                    tracing::trace!(msg_id = %envelope.msg_id, kind = envelope.kind(), "retransmitting");
                    if let Err(err) = transport.send(envelope).await {
                        tracing::warn!(error = %err, "retransmit failed");
                    }
                }
                for envelope in expired {
                    if matches!(envelope.body, Body::ConnectAck { .. }) {
                        // The client never confirmed the session; free the slot.
                        tracing::warn!(session_id = %envelope.session_id, "handshake abandoned");
                        close_session(&mut active);
                    }
                }
            }
        }
    }

    if let Some(session) = &mut active {
        let envelope = outbound(config.protocol, session, Body::Disconnect {});
        let _ = transport.send(envelope).await;
    }
    close_session(&mut active);
    transport.close().await;
    Ok(())
}

async fn next_pty_event(active: &mut Option<ActiveSession>) -> Option<PtyEvent> {
    match active.as_mut().and_then(|session| session.pty_events.as_mut()) {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

fn outbound(protocol: Protocol, session: &mut ActiveSession, body: Body) -> Envelope {
    Envelope::new(
        protocol,
        session.session_id.clone(),
        Role::Server,
        session.seq.next(),
        body,
    )
}

async fn send_tracked(
    transport: &Arc<dyn Transport>,
    link_reliable: bool,
    retry: &mut RetryQueue,
    envelope: Envelope,
) -> Result<()> {
    transport.send(envelope.clone()).await?;
    if !link_reliable {
        retry.enqueue(envelope, Instant::now());
    }
    Ok(())
}

fn close_session(active: &mut Option<ActiveSession>) {
    if let Some(session) = active.take() {
        tracing::info!(session_id = %session.session_id, "session closed");
        if let Some(pty) = &session.pty {
            pty.kill();
        }
    }
}

async fn handle_envelope(
    transport: &Arc<dyn Transport>,
    config: &ServerConfig,
    link_reliable: bool,
    retry: &mut RetryQueue,
    active: &mut Option<ActiveSession>,
    envelope: Envelope,
) -> Result<()> {
    if envelope.target != Role::Server {
        return Ok(());
    }
    tracing::debug!(kind = envelope.kind(), msg_id = %envelope.msg_id, seq = envelope.seq, "inbound");

    if let Body::ConnectReq { host } = &envelope.body {
        return handle_connect(
            transport,
            config,
            link_reliable,
            retry,
            active,
            &envelope,
            host,
        )
        .await;
    }

    let Some(session) = active.as_mut() else {
        return Ok(());
    };
    if envelope.session_id != session.session_id {
        return Ok(());
    }

    // Polled media may surface the client's envelopes out of order.
    let deliverable = match session.reorder.as_mut() {
        Some(reorder) => reorder.push(envelope),
        None => vec![envelope],
    };
    for envelope in deliverable {
        let done = dispatch_session_envelope(transport, config, link_reliable, retry, active, envelope).await?;
        if done {
            close_session(active);
            break;
        }
    }
    Ok(())
}

async fn handle_connect(
    transport: &Arc<dyn Transport>,
    config: &ServerConfig,
    link_reliable: bool,
    retry: &mut RetryQueue,
    active: &mut Option<ActiveSession>,
    envelope: &Envelope,
    client_host: &str,
) -> Result<()> {
    if let Some(session) = active.as_mut() {
        if session.connect_msg_id == envelope.msg_id {
            // Retransmit of the accepted request; the pending connect_ack
            // retry covers it.
            return Ok(());
        }
        tracing::info!(session_id = %session.session_id, "rejecting second client: busy");
        let busy = outbound(
            config.protocol,
            session,
            Body::Busy {
                session_id: session.session_id.clone(),
            },
        );
        return send_tracked(transport, link_reliable, retry, busy).await;
    }

    let session_id = Uuid::new_v4().to_string();
    let shell_path = match resolve_shell(&config.preferred_shell) {
        Ok(path) => path,
        Err(err) => {
            tracing::error!(error = %err, "shell resolution failed");
            return reject_connect(transport, config, link_reliable, retry, &session_id, err).await;
        }
    };

    let mut session = ActiveSession {
        session_id: session_id.clone(),
        connect_msg_id: envelope.msg_id.clone(),
        seq: SeqGen::new(),
        shell_path: shell_path.clone(),
        pty: None,
        pty_events: None,
        reorder: (!link_reliable).then(ReorderBuffer::default),
    };

    let (cols, rows) = (80u16, 24u16);
    if config.protocol == Protocol::GitsshV2 {
        let (events_tx, events_rx) = mpsc::channel(PTY_EVENT_QUEUE);
        match PtyShell::spawn(&shell_path, cols, rows, events_tx) {
            Ok(pty) => {
                session.pty = Some(pty);
                session.pty_events = Some(events_rx);
            }
            Err(err) => {
                tracing::error!(error = %err, "pty shell spawn failed");
                return reject_connect(transport, config, link_reliable, retry, &session_id, err)
                    .await;
            }
        }
    }

    let user = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
    let host = nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    let cwd = std::env::current_dir()
        .map(|dir| dir.display().to_string())
        .unwrap_or_else(|_| "/".to_string());

    tracing::info!(
        session_id = %session_id,
        shell = %shell_path.display(),
        client_host,
        "session accepted"
    );
    let ack = outbound(
        config.protocol,
        &mut session,
        Body::ConnectAck {
            session_id: session_id.clone(),
            user,
            host,
            cwd,
            cols,
            rows,
        },
    );
    *active = Some(session);
    send_tracked(transport, link_reliable, retry, ack).await
}

async fn reject_connect(
    transport: &Arc<dyn Transport>,
    config: &ServerConfig,
    link_reliable: bool,
    retry: &mut RetryQueue,
    session_id: &str,
    err: SessionError,
) -> Result<()> {
    let mut seq = SeqGen::new();
    let error = Envelope::new(
        config.protocol,
        session_id,
        Role::Server,
        seq.next(),
        Body::Error {
            code: "shell".to_string(),
            message: err.to_string(),
        },
    );
    send_tracked(transport, link_reliable, retry, error).await?;
    let disconnect = Envelope::new(
        config.protocol,
        session_id,
        Role::Server,
        seq.next(),
        Body::Disconnect {},
    );
    send_tracked(transport, link_reliable, retry, disconnect).await
}

/// Returns Ok(true) when the session ended.
async fn dispatch_session_envelope(
    transport: &Arc<dyn Transport>,
    config: &ServerConfig,
    link_reliable: bool,
    retry: &mut RetryQueue,
    active: &mut Option<ActiveSession>,
    envelope: Envelope,
) -> Result<bool> {
    let Some(session) = active.as_mut() else {
        return Ok(false);
    };

    match envelope.body {
        Body::Cmd { ref text } => {
            if config.protocol != Protocol::ClipsshV1 {
                return protocol_error(transport, config, link_reliable, retry, session, "cmd").await;
            }
            handle_command(
                transport,
                config,
                link_reliable,
                retry,
                session,
                &envelope.msg_id,
                text,
            )
            .await?;
            Ok(false)
        }
        Body::PtyInput { ref data } => {
            let Some(pty) = &session.pty else {
                return protocol_error(transport, config, link_reliable, retry, session, "pty_input").await;
            };
            if let Err(err) = pty.write_input(data) {
                tracing::warn!(error = %err, "pty input write failed");
            }
            Ok(false)
        }
        Body::PtyResize { cols, rows } => {
            if let Some(pty) = &session.pty {
                if let Err(err) = pty.resize(cols, rows) {
                    tracing::warn!(error = %err, "pty resize failed");
                }
            }
            Ok(false)
        }
        Body::PtySignal { name } => {
            if let Some(pty) = &session.pty {
                if let Err(err) = pty.signal(name) {
                    tracing::warn!(error = %err, "pty signal failed");
                }
            }
            Ok(false)
        }
        Body::Disconnect {} => {
            tracing::info!(session_id = %session.session_id, "client disconnected");
            Ok(true)
        }
        Body::Error { ref code, ref message } => {
            tracing::warn!(code, message, "client reported error");
            Ok(false)
        }
        // Client-bound kinds arriving here are a peer protocol bug; tell
        // them and stay connected.
        _ => protocol_error(transport, config, link_reliable, retry, session, envelope.kind()).await,
    }
}

async fn protocol_error(
    transport: &Arc<dyn Transport>,
    config: &ServerConfig,
    link_reliable: bool,
    retry: &mut RetryQueue,
    session: &mut ActiveSession,
    kind: &str,
) -> Result<bool> {
    let error = outbound(
        config.protocol,
        session,
        Body::Error {
            code: "protocol".to_string(),
            message: format!("kind {kind} is not valid in this state"),
        },
    );
    send_tracked(transport, link_reliable, retry, error).await?;
    Ok(false)
}

/// Execute one CLIPSSH/1 command and stream its reply. A retransmitted
/// `cmd` never lands here twice: the transport adapter's msg_id dedup drops
/// duplicates before they reach the session, and lost replies are covered
/// by this side's own retransmission queue.
async fn handle_command(
    transport: &Arc<dyn Transport>,
    config: &ServerConfig,
    link_reliable: bool,
    retry: &mut RetryQueue,
    session: &mut ActiveSession,
    cmd_msg_id: &str,
    text: &str,
) -> Result<()> {
    tracing::info!(session_id = %session.session_id, command = text, "executing command");
    let (stdout, stderr, code) =
        execute_command(&session.shell_path, text, config.command_timeout).await;

    for chunk in stdout.chunks(MAX_CHUNK_BYTES) {
        let reply = outbound(
            config.protocol,
            session,
            Body::Stdout {
                cmd_id: cmd_msg_id.to_string(),
                data: chunk.to_vec(),
            },
        );
        send_tracked(transport, link_reliable, retry, reply).await?;
    }
    for chunk in stderr.chunks(MAX_CHUNK_BYTES) {
        let reply = outbound(
            config.protocol,
            session,
            Body::Stderr {
                cmd_id: cmd_msg_id.to_string(),
                data: chunk.to_vec(),
            },
        );
        send_tracked(transport, link_reliable, retry, reply).await?;
    }
    let exit = outbound(
        config.protocol,
        session,
        Body::Exit {
            cmd_id: cmd_msg_id.to_string(),
            code,
        },
    );
    send_tracked(transport, link_reliable, retry, exit).await
}

async fn execute_command(
    shell_path: &std::path::Path,
    text: &str,
    timeout: Duration,
) -> (Vec<u8>, Vec<u8>, i32) {
    let result = tokio::time::timeout(
        timeout,
        tokio::process::Command::new(shell_path)
            .arg("-c")
            .arg(text)
            .kill_on_drop(true)
            .output(),
    )
    .await;

    match result {
        Ok(Ok(output)) => (
            output.stdout,
            output.stderr,
            output.status.code().unwrap_or(1),
        ),
        Ok(Err(err)) => (
            Vec::new(),
            format!("command failed to start: {err}\n").into_bytes(),
            1,
        ),
        Err(_) => (
            Vec::new(),
            format!("command timed out after {}s\n", timeout.as_secs()).into_bytes(),
            124,
        ),
    }
}

async fn handle_pty_event(
    transport: &Arc<dyn Transport>,
    link_reliable: bool,
    retry: &mut RetryQueue,
    active: &mut Option<ActiveSession>,
    event: Option<PtyEvent>,
) -> Result<()> {
    let Some(session) = active.as_mut() else {
        return Ok(());
    };
    match event {
        Some(PtyEvent::Output(chunk)) => {
            let envelope = outbound(
                Protocol::GitsshV2,
                session,
                Body::PtyOutput { data: chunk },
            );
            send_tracked(transport, link_reliable, retry, envelope).await
        }
        Some(PtyEvent::Exited(exit_status)) => {
            tracing::info!(session_id = %session.session_id, exit_status, "shell exited");
            let envelope = outbound(
                Protocol::GitsshV2,
                session,
                Body::PtyClosed { exit_status },
            );
            send_tracked(transport, link_reliable, retry, envelope).await?;
            close_session(active);
            Ok(())
        }
        None => {
            // Reader thread gone without an exit event; treat as closure.
            let envelope = outbound(
                Protocol::GitsshV2,
                session,
                Body::PtyClosed { exit_status: 1 },
            );
            send_tracked(transport, link_reliable, retry, envelope).await?;
            close_session(active);
            Ok(())
        }
    }
}
