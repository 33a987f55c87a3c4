//! `MentorChat`: console chat client.
//!
//! Connects to the backend for one user and keeps conversations in sync.
//! Configuration via CLI flags, environment variables, or config file
//! (`~/.config/mentorchat/config.toml`).
//!
//! ```bash
//! cargo run --bin mentorchat -- --base-url http://127.0.0.1:8000 --user-id 12
//!
//! # Or via environment variables
//! MENTORCHAT_URL=http://127.0.0.1:8000 MENTORCHAT_USER=12 cargo run --bin mentorchat
//! ```

use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_appender::non_blocking::WorkerGuard;

use mentorchat::chat::ChatEvent;
use mentorchat::config::{CliArgs, ClientConfig};
use mentorchat::console::{self, Console, Flow, ParseError};
use mentorchat::net::{self, SessionHandle};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    // Load and resolve configuration (CLI args > env > config file > defaults).
    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };
    let net_config = match config.to_net_config() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e} (see --help)");
            return ExitCode::FAILURE;
        }
    };

    // Logs go to a file; stdout belongs to the console.
    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());

    tracing::info!(user = %net_config.user_id, url = %net_config.base_url, "mentorchat starting");

    let mut console = Console::new(net_config.user_id.clone(), config.timestamp_format.clone());
    let (session, events) = match net::spawn_http_session(net_config) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    println!("type /help for commands");
    run_console(&mut console, &session, events).await;
    session.shutdown().await;

    tracing::info!("mentorchat exiting");
    ExitCode::SUCCESS
}

/// Initialize file-based logging.
///
/// Returns a [`WorkerGuard`] that must be held until shutdown to ensure all
/// buffered log entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("mentorchat.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

/// Read commands from stdin and print session events until `/quit`, EOF,
/// or the session stops.
async fn run_console(
    console: &mut Console,
    session: &SessionHandle,
    mut events: tokio::sync::mpsc::Receiver<ChatEvent>,
) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut out = Vec::new();

    loop {
        let result = tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => match console::parse_command(&line) {
                    Ok(command) => console.execute(command, session, &mut out).await,
                    Err(ParseError::Empty) => Ok(Flow::Continue),
                    Err(e) => {
                        out.push(e.to_string());
                        Ok(Flow::Continue)
                    }
                },
                Ok(None) => Ok(Flow::Quit),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to read stdin");
                    Ok(Flow::Quit)
                }
            },
            Some(event) = events.recv() => console
                .on_event(event, session, &mut out)
                .await
                .map(|()| Flow::Continue),
        };

        for line in out.drain(..) {
            println!("{line}");
        }

        match result {
            Ok(Flow::Continue) => {}
            Ok(Flow::Quit) => break,
            Err(e) => {
                tracing::warn!(error = %e, "session stopped");
                println!("session stopped: {e}");
                break;
            }
        }
    }
}
