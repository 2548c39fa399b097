//! Clipboard command/reply client.

use std::io::Write;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use clipssh_cli::{
    init_tracing, ClipboardArgs, CONNECT_TIMEOUT, EXIT_INTERRUPT, EXIT_OK, EXIT_TRANSPORT,
};
use clipssh_protocol::Protocol;
use clipssh_session::client::ClientSession;
use clipssh_session::SessionError;

#[derive(Parser, Debug)]
#[command(name = "sshc", about = "Clipboard transport SSH client", version)]
struct Cli {
    /// ssh-style target host (informational in this local emulator).
    host: String,

    #[command(flatten)]
    clipboard: ClipboardArgs,

    /// Enable verbose logs.
    #[arg(short, long)]
    verbose: bool,

    /// Seconds to wait for each command's reply.
    #[arg(long = "command-timeout", default_value_t = 300.0)]
    command_timeout: f64,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing("sshc", cli.verbose);
    std::process::exit(match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("sshc: {err:#}");
            EXIT_TRANSPORT
        }
    });
}

async fn run(cli: Cli) -> Result<i32> {
    let transport = cli.clipboard.build_transport().await?;

    let mut session = match ClientSession::connect(
        transport,
        Protocol::ClipsshV1,
        &cli.host,
        CONNECT_TIMEOUT,
    )
    .await
    {
        Ok(session) => session,
        Err(SessionError::Busy { session_id }) => {
            eprintln!("sshc: server is busy with session {session_id}");
            return Ok(EXIT_TRANSPORT);
        }
        Err(err) => return Err(err.into()),
    };

    let command_timeout = Duration::from_secs_f64(cli.command_timeout.max(1.0));
    let prompt = session.prompt();

    loop {
        print!("{prompt}");
        std::io::stdout().flush()?;

        let read = tokio::select! {
            read = tokio::task::spawn_blocking(|| {
                let mut line = String::new();
                std::io::stdin().read_line(&mut line).map(|n| (n, line))
            }) => read??,
            _ = tokio::signal::ctrl_c() => {
                println!();
                let _ = session.disconnect().await;
                return Ok(EXIT_INTERRUPT);
            }
        };
        let (n, input) = read;
        if n == 0 {
            println!();
            break;
        }
        let command = input.trim();
        if command.is_empty() {
            continue;
        }

        match session.execute(command, command_timeout).await {
            Ok(result) => {
                std::io::stdout().write_all(&result.stdout)?;
                std::io::stderr().write_all(&result.stderr)?;
                if cli.verbose {
                    tracing::debug!(exit_code = result.exit_code, "command finished");
                }
            }
            Err(SessionError::Timeout(what)) => {
                eprintln!("sshc: timed out waiting for {what}");
            }
            Err(err) => {
                eprintln!("sshc: {err}");
                let _ = session.disconnect().await;
                return Ok(EXIT_TRANSPORT);
            }
        }
    }

    session.disconnect().await?;
    Ok(EXIT_OK)
}
