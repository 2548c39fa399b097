//! Interactive gitssh/2 server daemon over a selectable side channel.

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::sync::watch;

use clipssh_cli::{init_tracing, GitsshTransportArgs, EXIT_OK, EXIT_SHELL, EXIT_TRANSPORT};
use clipssh_protocol::{Protocol, Role};
use clipssh_session::pty::resolve_shell;
use clipssh_session::server::{run_server, ServerConfig};
use clipssh_session::SessionError;

#[derive(Parser, Debug)]
#[command(name = "sshgd", about = "Interactive SSH server daemon over unconventional transports", version)]
struct Cli {
    #[command(flatten)]
    transport: GitsshTransportArgs,

    /// Preferred shell executable name or path.
    #[arg(long, default_value = "tcsh")]
    shell: String,

    /// Enable verbose logs.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing("sshgd", cli.verbose);
    std::process::exit(match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("sshgd: {err:#}");
            EXIT_TRANSPORT
        }
    });
}

async fn run(cli: Cli) -> Result<i32> {
    if let Err(err) = resolve_shell(&cli.shell) {
        eprintln!("sshgd: {err}");
        return Ok(EXIT_SHELL);
    }

    let config = ServerConfig {
        protocol: Protocol::GitsshV2,
        preferred_shell: cli.shell.clone(),
        ..ServerConfig::default()
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = shutdown_tx.send(true);
    });

    let mut backoff = Duration::from_millis(500);
    loop {
        let transport = cli.transport.build_transport(Role::Server).await?;
        match run_server(transport, config.clone(), shutdown_rx.clone()).await {
            Ok(()) => return Ok(EXIT_OK),
            Err(SessionError::Transport(err)) => {
                if *shutdown_rx.borrow() {
                    return Ok(EXIT_OK);
                }
                if !cli.transport.transport.reopens_on_failure() {
                    // Serial and audio failures are hardware-grade; tell
                    // the user instead of silently reconnecting.
                    eprintln!("sshgd: transport failed: {err}");
                    return Ok(EXIT_TRANSPORT);
                }
                tracing::warn!(error = %err, "transport failed, re-opening");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_secs(10));
            }
            Err(err) => return Err(err.into()),
        }
    }
}
