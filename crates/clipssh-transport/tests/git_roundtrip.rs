//! End-to-end git transport tests against real bare repositories.
//!
//! Skipped silently when no `git` binary is on PATH.

use std::process::Command;
use std::time::Duration;

use clipssh_protocol::{Body, Envelope, Protocol, Role};
use clipssh_transport::git::{GitTransport, GitTransportConfig};
use clipssh_transport::Transport;

fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

fn fast(mut config: GitTransportConfig) -> GitTransportConfig {
    config.sync_interval = Duration::from_millis(50);
    config
}

fn envelope(seq: u64, body: Body) -> Envelope {
    Envelope::new(
        Protocol::GitsshV2,
        uuid::Uuid::new_v4().to_string(),
        Role::Client,
        seq,
        body,
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn envelopes_travel_client_to_server_through_the_upstream() {
    if !git_available() {
        eprintln!("git not installed; skipping");
        return;
    }

    let root = tempfile::tempdir().unwrap();
    let upstream = root.path().join("upstream.git");
    Command::new("git")
        .args(["init", "--bare", upstream.to_str().unwrap()])
        .output()
        .unwrap();
    let upstream_url = upstream.to_string_lossy().to_string();

    let client = GitTransport::spawn(fast(GitTransportConfig::for_client(
        root.path().join("client.git"),
        upstream_url.clone(),
    )))
    .await
    .unwrap();
    let server = GitTransport::spawn(fast(GitTransportConfig::for_server(
        root.path().join("server.git"),
        upstream_url,
    )))
    .await
    .unwrap();

    // Client to server, then server back to client.
    let req = envelope(0, Body::ConnectReq { host: "localhost".into() });
    client.send(req.clone()).await.unwrap();
    let got = server.recv(Duration::from_secs(15)).await.unwrap();
    assert_eq!(got, Some(req));

    let mut ack = envelope(
        0,
        Body::ConnectAck {
            session_id: uuid::Uuid::new_v4().to_string(),
            user: "tester".into(),
            host: "testhost".into(),
            cwd: "/tmp".into(),
            cols: 80,
            rows: 24,
        },
    );
    ack.source = Role::Server;
    ack.target = Role::Client;
    server.send(ack.clone()).await.unwrap();
    let got = client.recv(Duration::from_secs(15)).await.unwrap();
    assert_eq!(got, Some(ack));

    // Ordering across several frames on one branch.
    for seq in 1..4u64 {
        client
            .send(envelope(
                seq,
                Body::PtyInput {
                    data: format!("line-{seq}\n").into_bytes(),
                },
            ))
            .await
            .unwrap();
    }
    for seq in 1..4u64 {
        let got = server
            .recv(Duration::from_secs(15))
            .await
            .unwrap()
            .expect("expected ordered frame");
        assert_eq!(got.seq, seq);
    }

    client.close().await;
    server.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cursor_survives_transport_restart() {
    if !git_available() {
        eprintln!("git not installed; skipping");
        return;
    }

    let root = tempfile::tempdir().unwrap();
    let upstream = root.path().join("upstream.git");
    Command::new("git")
        .args(["init", "--bare", upstream.to_str().unwrap()])
        .output()
        .unwrap();
    let upstream_url = upstream.to_string_lossy().to_string();
    let server_mirror = root.path().join("server.git");

    let client = GitTransport::spawn(fast(GitTransportConfig::for_client(
        root.path().join("client.git"),
        upstream_url.clone(),
    )))
    .await
    .unwrap();

    let first = envelope(0, Body::Disconnect {});
    client.send(first.clone()).await.unwrap();

    {
        let server = GitTransport::spawn(fast(GitTransportConfig::for_server(
            server_mirror.clone(),
            upstream_url.clone(),
        )))
        .await
        .unwrap();
        assert_eq!(
            server.recv(Duration::from_secs(15)).await.unwrap(),
            Some(first.clone())
        );
        server.close().await;
    }

    // A restarted server must not replay the already-consumed commit: the
    // cursor ref in its mirror remembers where it stopped.
    let second = envelope(1, Body::Disconnect {});
    client.send(second.clone()).await.unwrap();

    let server = GitTransport::spawn(fast(GitTransportConfig::for_server(
        server_mirror,
        upstream_url,
    )))
    .await
    .unwrap();
    assert_eq!(
        server.recv(Duration::from_secs(15)).await.unwrap(),
        Some(second)
    );
    assert_eq!(
        server.recv(Duration::from_millis(500)).await.unwrap(),
        None
    );

    client.close().await;
    server.close().await;
}
