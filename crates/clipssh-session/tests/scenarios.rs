//! End-to-end session scenarios over real in-process media.
//!
//! The clipboard scenarios run over a shared in-memory clipboard (the same
//! polling transport code paths as the external tools, minus the child
//! processes). The interactive scenarios run the serial link over a Unix
//! socket pair, which exercises framing, ACK/retry and PTY plumbing.

use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use clipssh_protocol::{Body, Envelope, Protocol, Role, SeqGen};
use clipssh_session::client::ClientSession;
use clipssh_session::server::{run_server, ServerConfig};
use clipssh_session::{SessionError, SessionEvent};
use clipssh_transport::clipboard::{ClipboardIo, ClipboardTransport, MemoryClipboard};
use clipssh_transport::serial::{file_from_owned_fd, SerialTransport, SerialTransportConfig};
use clipssh_transport::Transport;

fn clipboard_transport(clipboard: &Arc<MemoryClipboard>) -> Arc<dyn Transport> {
    Arc::new(ClipboardTransport::spawn(
        clipboard.clone(),
        Duration::from_millis(20),
    ))
}

fn serial_pair() -> (Arc<dyn Transport>, Arc<dyn Transport>) {
    let (a, b) = UnixStream::pair().unwrap();
    a.set_nonblocking(true).unwrap();
    b.set_nonblocking(true).unwrap();
    let config = SerialTransportConfig {
        ack_timeout: Duration::from_millis(100),
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
    (Arc::new(ta), Arc::new(tb))
}

fn server_config(protocol: Protocol) -> ServerConfig {
    ServerConfig {
        protocol,
        preferred_shell: "/bin/sh".to_string(),
        command_timeout: Duration::from_secs(30),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn clipboard_echo_round_trip() {
    let clipboard = MemoryClipboard::shared();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server_transport = clipboard_transport(&clipboard);
    let server = tokio::spawn(run_server(
        server_transport,
        server_config(Protocol::ClipsshV1),
        shutdown_rx,
    ));

    let client_transport = clipboard_transport(&clipboard);
    let mut session = ClientSession::connect(
        client_transport,
        Protocol::ClipsshV1,
        "localhost",
        Duration::from_secs(20),
    )
    .await
    .unwrap();
    assert!(!session.session_id().is_empty());
    assert!(!session.server().user.is_empty());

    let result = session
        .execute("echo hi", Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(result.stdout, b"hi\n");
    assert_eq!(result.exit_code, 0);

    // Stderr stays separate from stdout.
    let result = session
        .execute("echo oops 1>&2; exit 3", Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(result.stdout, b"");
    assert_eq!(String::from_utf8_lossy(&result.stderr), "oops\n");
    assert_eq!(result.exit_code, 3);

    session.disconnect().await.unwrap();
    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(5), server).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn retransmitted_cmd_produces_one_reply_stream() {
    let clipboard = MemoryClipboard::shared();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server = tokio::spawn(run_server(
        clipboard_transport(&clipboard),
        server_config(Protocol::ClipsshV1),
        shutdown_rx,
    ));

    // Drive the transport by hand so the cmd envelope's msg_id stays under
    // our control across the "retransmission".
    let transport = clipboard_transport(&clipboard);
    let mut seq = SeqGen::new();
    let connect = Envelope::new(
        Protocol::ClipsshV1,
        "",
        Role::Client,
        seq.next(),
        Body::ConnectReq {
            host: "localhost".into(),
        },
    );
    transport.send(connect.clone()).await.unwrap();
    let session_id = loop {
        match transport.recv(Duration::from_secs(2)).await.unwrap() {
            Some(envelope) => {
                if let Body::ConnectAck { session_id, .. } = envelope.body {
                    break session_id;
                }
            }
            None => transport.send(connect.clone()).await.unwrap(),
        }
    };

    // The first reply is "lost" from the client's point of view, so the
    // exact same envelope goes on the medium again.
    let cmd = Envelope::new(
        Protocol::ClipsshV1,
        session_id,
        Role::Client,
        seq.next(),
        Body::Cmd {
            text: "echo once".into(),
        },
    );
    transport.send(cmd.clone()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    // Non-protocol noise in between, so the medium's same-content filter
    // cannot mask the retransmission; the msg_id window has to do the
    // suppression.
    clipboard
        .write_text("unrelated clipboard traffic")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    transport.send(cmd.clone()).await.unwrap();

    // Collect long enough that a second execution would have surfaced as a
    // fresh stdout/exit pair with new msg_ids but the same cmd_id.
    let mut stdout_count = 0u32;
    let mut exit_count = 0u32;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        let Some(envelope) = transport.recv(Duration::from_millis(250)).await.unwrap() else {
            continue;
        };
        match envelope.body {
            Body::Stdout { cmd_id, data } if cmd_id == cmd.msg_id => {
                assert_eq!(data, b"once\n");
                stdout_count += 1;
            }
            Body::Exit { cmd_id, code } if cmd_id == cmd.msg_id => {
                assert_eq!(code, 0);
                exit_count += 1;
            }
            _ => {}
        }
    }
    assert_eq!(stdout_count, 1, "command executed or replied more than once");
    assert_eq!(exit_count, 1);

    transport.close().await;
    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(5), server).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn second_client_gets_busy_with_the_active_session_id() {
    let clipboard = MemoryClipboard::shared();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server = tokio::spawn(run_server(
        clipboard_transport(&clipboard),
        server_config(Protocol::ClipsshV1),
        shutdown_rx,
    ));

    let mut first = ClientSession::connect(
        clipboard_transport(&clipboard),
        Protocol::ClipsshV1,
        "localhost",
        Duration::from_secs(20),
    )
    .await
    .unwrap();
    // Let the handshake fully settle before the contender shows up.
    let _ = first.execute("true", Duration::from_secs(30)).await.unwrap();
    let active_id = first.session_id().to_string();

    let outcome = ClientSession::connect(
        clipboard_transport(&clipboard),
        Protocol::ClipsshV1,
        "localhost",
        Duration::from_secs(20),
    )
    .await;
    match outcome {
        Err(SessionError::Busy { session_id }) => assert_eq!(session_id, active_id),
        other => panic!("expected busy, got {other:?}"),
    }

    first.disconnect().await.unwrap();
    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(5), server).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn interactive_pty_over_the_serial_link() {
    let (server_transport, client_transport) = serial_pair();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server = tokio::spawn(run_server(
        server_transport,
        server_config(Protocol::GitsshV2),
        shutdown_rx,
    ));

    let mut session = ClientSession::connect(
        client_transport,
        Protocol::GitsshV2,
        "localhost",
        Duration::from_secs(20),
    )
    .await
    .unwrap();
    assert_eq!(session.server().cols, 80);

    session.resize(120, 40).await.unwrap();
    session.send_input(b"pwd\n").await.unwrap();

    let expected_cwd = std::env::current_dir().unwrap().display().to_string();
    let mut output = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    while !String::from_utf8_lossy(&output).contains(&expected_cwd) {
        assert!(
            tokio::time::Instant::now() < deadline,
            "no pwd output; got {:?}",
            String::from_utf8_lossy(&output)
        );
        if let Some(event) = session.next_event(Duration::from_millis(500)).await.unwrap() {
            if let SessionEvent::PtyOutput(chunk) = event {
                output.extend_from_slice(&chunk);
            }
        }
    }

    session.send_input(b"exit 5\n").await.unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    loop {
        assert!(
            tokio::time::Instant::now() < deadline,
            "shell never reported closure"
        );
        match session.next_event(Duration::from_millis(500)).await.unwrap() {
            Some(SessionEvent::PtyClosed { exit_status }) => {
                assert_eq!(exit_status, 5);
                break;
            }
            _ => continue,
        }
    }

    session.disconnect().await.unwrap();
    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(5), server).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn signals_reach_the_foreground_process() {
    let (server_transport, client_transport) = serial_pair();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server = tokio::spawn(run_server(
        server_transport,
        server_config(Protocol::GitsshV2),
        shutdown_rx,
    ));

    let mut session = ClientSession::connect(
        client_transport,
        Protocol::GitsshV2,
        "localhost",
        Duration::from_secs(20),
    )
    .await
    .unwrap();

    // Interrupt a long-running foreground job. Depending on the shell's
    // job-control behavior the INT either returns control to the prompt or
    // takes the whole group down; both prove the sleep was interrupted.
    session.send_input(b"sleep 600\n").await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    session
        .signal(clipssh_protocol::SignalName::Int)
        .await
        .unwrap();
    session.send_input(b"echo survived-$?\n").await.unwrap();

    let mut output = Vec::new();
    let mut interrupted = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    while tokio::time::Instant::now() < deadline {
        match session.next_event(Duration::from_millis(500)).await {
            Ok(Some(SessionEvent::PtyOutput(chunk))) => {
                output.extend_from_slice(&chunk);
                if String::from_utf8_lossy(&output).contains("survived-") {
                    interrupted = true;
                    break;
                }
            }
            Ok(Some(SessionEvent::PtyClosed { .. })) | Err(_) => {
                interrupted = true;
                break;
            }
            _ => continue,
        }
    }
    assert!(interrupted, "sleep 600 was never interrupted");

    let _ = session.disconnect().await;
    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(5), server).await;
}
