//! Tally daemon entrypoint.
//!
//! A small background service that accumulates conversation metrics from
//! one-way host event notifications and answers stats queries over a local
//! Unix socket. State lives only in memory; a restart starts a fresh session.

use clap::Parser;
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod dispatch;
mod server;
mod stats;

use server::Server;
use stats::StatsLedger;

#[derive(Parser)]
#[command(name = "tally-daemon")]
#[command(about = "Conversation metrics daemon")]
#[command(version)]
struct Cli {
    /// Listening socket path (defaults to $TALLY_SOCKET, then ~/.tally/daemon.sock)
    #[arg(long)]
    socket: Option<PathBuf>,
}

fn main() {
    init_logging();
    let cli = Cli::parse();

    let socket_path = match resolve_socket_path(cli.socket) {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve daemon socket path");
            std::process::exit(1);
        }
    };

    let ledger = Arc::new(StatsLedger::new());
    let server = match Server::bind(&socket_path, ledger) {
        Ok(server) => server,
        Err(err) => {
            error!(error = %err, path = %socket_path.display(), "Failed to bind daemon socket");
            std::process::exit(1);
        }
    };

    let shutdown = server.shutdown_flag();
    for signal in [SIGINT, SIGTERM] {
        if let Err(err) = signal_hook::flag::register(signal, Arc::clone(&shutdown)) {
            warn!(error = %err, signal, "Failed to register shutdown signal");
        }
    }

    info!(path = %socket_path.display(), "Tally daemon started");
    server.run();
}

fn resolve_socket_path(cli_socket: Option<PathBuf>) -> Result<PathBuf, String> {
    match cli_socket {
        Some(path) => Ok(path),
        None => tally_daemon_protocol::default_socket_path(),
    }
}

fn init_logging() {
    let debug_enabled = env::var("TALLY_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
