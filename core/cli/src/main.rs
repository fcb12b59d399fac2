//! tally: CLI client for the Tally conversation-metrics daemon.
//!
//! Lets the host process (or an operator at a shell) emit conversation
//! events and query the accumulated statistics.
//!
//! ## Subcommands
//!
//! - `health`: liveness probe
//! - `stats`: print the current statistics snapshot
//! - `reset`: zero the counters, printing the previous snapshot
//! - `event`: send an on_event notification

mod daemon_client;

use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use daemon_client::{ClientError, DaemonClient};
use tally_daemon_protocol::Method;

#[derive(Parser)]
#[command(name = "tally")]
#[command(about = "Client for the Tally conversation-metrics daemon")]
#[command(version)]
struct Cli {
    /// Daemon socket path (defaults to $TALLY_SOCKET, then ~/.tally/daemon.sock)
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the daemon is up
    Health,

    /// Print the current statistics snapshot
    Stats,

    /// Reset all statistics, printing the previous snapshot
    Reset,

    /// Send an event notification (no response expected)
    Event {
        /// Event tag, e.g. TOOL_CALL_START
        #[arg(value_name = "TYPE")]
        event_type: String,

        /// Event payload as a JSON object
        #[arg(long, default_value = "{}")]
        data: String,
    },
}

fn main() {
    init_logging();
    let cli = Cli::parse();

    let socket_path = match resolve_socket_path(cli.socket) {
        Ok(path) => path,
        Err(err) => {
            tracing::error!(error = %err, "Failed to resolve daemon socket path");
            std::process::exit(1);
        }
    };
    let client = DaemonClient::new(socket_path);

    let outcome = match cli.command {
        Commands::Health => print_result(client.request(Method::HealthCheck, None)),
        Commands::Stats => print_result(client.request(Method::GetStats, None)),
        Commands::Reset => print_result(client.request(Method::ResetStats, None)),
        Commands::Event { event_type, data } => send_event(&client, &event_type, &data),
    };

    if let Err(err) = outcome {
        tracing::error!(error = %err, "tally command failed");
        std::process::exit(1);
    }
}

fn resolve_socket_path(cli_socket: Option<PathBuf>) -> Result<PathBuf, String> {
    match cli_socket {
        Some(path) => Ok(path),
        None => tally_daemon_protocol::default_socket_path(),
    }
}

fn print_result(result: Result<Value, ClientError>) -> Result<(), ClientError> {
    let value = result?;
    match serde_json::to_string_pretty(&value) {
        Ok(rendered) => println!("{rendered}"),
        Err(_) => println!("{value}"),
    }
    Ok(())
}

fn send_event(client: &DaemonClient, event_type: &str, data: &str) -> Result<(), ClientError> {
    let event_data: Value =
        serde_json::from_str(data).map_err(ClientError::InvalidEventData)?;
    client.emit_event(event_type, event_data)
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
