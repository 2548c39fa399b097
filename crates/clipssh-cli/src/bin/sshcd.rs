//! Clipboard command/reply server daemon.

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::sync::watch;

use clipssh_cli::{init_tracing, ClipboardArgs, EXIT_OK, EXIT_SHELL, EXIT_TRANSPORT};
use clipssh_protocol::Protocol;
use clipssh_session::pty::resolve_shell;
use clipssh_session::server::{run_server, ServerConfig};
use clipssh_session::SessionError;

#[derive(Parser, Debug)]
#[command(name = "sshcd", about = "Clipboard transport SSH server daemon", version)]
struct Cli {
    #[command(flatten)]
    clipboard: ClipboardArgs,

    /// Preferred shell executable name or path.
    #[arg(long, default_value = "tcsh")]
    shell: String,

    /// Maximum seconds to wait for a command to finish.
    #[arg(long = "command-timeout", default_value_t = 120.0)]
    command_timeout: f64,

    /// Enable verbose logs.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing("sshcd", cli.verbose);
    std::process::exit(match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("sshcd: {err:#}");
            EXIT_TRANSPORT
        }
    });
}

async fn run(cli: Cli) -> Result<i32> {
    // A server that cannot start any shell should fail fast, not per
    // session.
    if let Err(err) = resolve_shell(&cli.shell) {
        eprintln!("sshcd: {err}");
        return Ok(EXIT_SHELL);
    }

    let config = ServerConfig {
        protocol: Protocol::ClipsshV1,
        preferred_shell: cli.shell.clone(),
        command_timeout: Duration::from_secs_f64(cli.command_timeout.max(1.0)),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = shutdown_tx.send(true);
    });

    // The clipboard can die with the desktop session; re-open with backoff
    // as long as shutdown was not requested.
    let mut backoff = Duration::from_millis(500);
    loop {
        let transport = cli.clipboard.build_transport().await?;
        match run_server(transport, config.clone(), shutdown_rx.clone()).await {
            Ok(()) => return Ok(EXIT_OK),
            Err(SessionError::Transport(err)) => {
                if *shutdown_rx.borrow() {
                    return Ok(EXIT_OK);
                }
                tracing::warn!(error = %err, "clipboard transport failed, re-opening");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_secs(10));
            }
            Err(err) => return Err(err.into()),
        }
    }
}
