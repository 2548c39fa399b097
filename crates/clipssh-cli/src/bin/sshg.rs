//! Interactive gitssh/2 client over a selectable side channel.

use std::io::Write;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

use clipssh_cli::{
    init_tracing, local_terminal_size, GitsshTransportArgs, RawModeGuard, CONNECT_TIMEOUT,
    EXIT_INTERRUPT, EXIT_OK, EXIT_TRANSPORT,
};
use clipssh_protocol::{Protocol, Role, SignalName};
use clipssh_session::client::{ClientSession, SessionEvent};
use clipssh_session::SessionError;

#[derive(Parser, Debug)]
#[command(name = "sshg", about = "Interactive SSH client over unconventional transports", version)]
struct Cli {
    /// ssh-style target host (informational in this local emulator).
    host: String,

    #[command(flatten)]
    transport: GitsshTransportArgs,

    /// Enable verbose logs.
    #[arg(short, long)]
    verbose: bool,

    /// Seconds to wait for the server handshake.
    #[arg(long = "connect-timeout")]
    connect_timeout: Option<f64>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing("sshg", cli.verbose);
    std::process::exit(match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("sshg: {err:#}");
            EXIT_TRANSPORT
        }
    });
}

async fn run(cli: Cli) -> Result<i32> {
    let transport = cli.transport.build_transport(Role::Client).await?;
    let connect_timeout = cli
        .connect_timeout
        .map(|secs| Duration::from_secs_f64(secs.max(1.0)))
        .unwrap_or(CONNECT_TIMEOUT);

    let mut session = match ClientSession::connect(
        transport,
        Protocol::GitsshV2,
        &cli.host,
        connect_timeout,
    )
    .await
    {
        Ok(session) => session,
        Err(SessionError::Busy { session_id }) => {
            eprintln!("sshg: server is busy with session {session_id}");
            return Ok(EXIT_TRANSPORT);
        }
        Err(err) => return Err(err.into()),
    };
    eprintln!(
        "sshg: connected to {}@{} (cwd {})",
        session.server().user,
        session.server().host,
        session.server().cwd
    );

    if let Some((cols, rows)) = local_terminal_size() {
        session.resize(cols, rows).await?;
    }

    // Raw terminal bytes in, PTY output bytes out, no local echo.
    let raw_guard = RawModeGuard::enable();

    let (stdin_tx, mut stdin_rx) = mpsc::channel::<Vec<u8>>(64);
    tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        let mut buf = [0u8; 4096];
        loop {
            match stdin.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stdin_tx.send(buf[..n].to_vec()).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut last_interrupt: Option<Instant> = None;
    let exit_code = loop {
        // Without a raw terminal, Ctrl-C reaches us as a signal. A single
        // one is forwarded to the remote foreground job; a second within a
        // second means the user wants out of the client itself.
        if !raw_guard.is_raw() && interrupted() {
            let now = Instant::now();
            if last_interrupt.is_some_and(|at| now.duration_since(at) < Duration::from_secs(1)) {
                drop(raw_guard);
                eprintln!("\nsshg: interrupted");
                let _ = session.disconnect().await;
                return Ok(EXIT_INTERRUPT);
            }
            last_interrupt = Some(now);
            session.signal(SignalName::Int).await?;
        }

        while let Ok(chunk) = stdin_rx.try_recv() {
            session.send_input(&chunk).await?;
        }

        match session.next_event(Duration::from_millis(50)).await {
            Ok(Some(SessionEvent::PtyOutput(data))) => {
                let mut stdout = std::io::stdout().lock();
                stdout.write_all(&data)?;
                stdout.flush()?;
            }
            Ok(Some(SessionEvent::PtyClosed { exit_status })) => {
                drop(raw_guard);
                eprintln!("\nsshg: remote shell exited with status {exit_status}");
                let _ = session.disconnect().await;
                return Ok(EXIT_OK);
            }
            Ok(Some(SessionEvent::Disconnected)) => {
                drop(raw_guard);
                eprintln!("\nsshg: server closed the session");
                break EXIT_OK;
            }
            Ok(Some(SessionEvent::PeerError { code, message })) => {
                drop(raw_guard);
                eprintln!("\nsshg: server error [{code}]: {message}");
                break EXIT_TRANSPORT;
            }
            Ok(Some(_)) | Ok(None) => {}
            Err(SessionError::Transport(err)) => {
                drop(raw_guard);
                eprintln!("\nsshg: transport failed: {err}");
                break EXIT_TRANSPORT;
            }
            // Retry exhaustion and other session failures are a dead or
            // misbehaving peer, not a user interrupt.
            Err(err) => {
                drop(raw_guard);
                eprintln!("\nsshg: {err}");
                break EXIT_TRANSPORT;
            }
        }
    };

    Ok(exit_code)
}

static INTERRUPT_FLAG: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(false);
static INTERRUPT_INIT: std::sync::Once = std::sync::Once::new();

extern "C" fn on_sigint(_: i32) {
    INTERRUPT_FLAG.store(true, std::sync::atomic::Ordering::SeqCst);
}

/// Non-blocking check for a pending Ctrl-C; installs the handler lazily.
fn interrupted() -> bool {
    INTERRUPT_INIT.call_once(|| unsafe {
        use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
        let action = SigAction::new(
            SigHandler::Handler(on_sigint),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        let _ = sigaction(Signal::SIGINT, &action);
    });
    INTERRUPT_FLAG.swap(false, std::sync::atomic::Ordering::SeqCst)
}
