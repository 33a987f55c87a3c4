//! `MentorChat` development server.
//!
//! Runs the in-memory backend so the client can be exercised locally.
//!
//! # Usage
//!
//! ```bash
//! # Run on default address 127.0.0.1:8000
//! cargo run --bin mentorchat-devserver
//!
//! # Run on custom address
//! cargo run --bin mentorchat-devserver -- --bind 0.0.0.0:8100
//! ```

use std::sync::Arc;

use clap::Parser;
use mentorchat_devserver::config::{DevCliArgs, DevConfig};
use mentorchat_devserver::server::{self, DevState};
use mentorchat_devserver::store::ChatDb;

#[tokio::main]
async fn main() {
    let cli = DevCliArgs::parse();

    let config = match DevConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::info!(addr = %config.bind_addr, users = config.users.len(), "starting dev server");

    let state = Arc::new(DevState::with_db(ChatDb::with_users(config.users)));

    match server::start_server_with_state(&config.bind_addr, state).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "dev server listening");
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "dev server task failed");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start dev server");
            std::process::exit(1);
        }
    }
}
