//! Socket listener and per-connection handling.
//!
//! One acceptor thread, one detached thread per accepted connection, no
//! pooling. A connection carries exactly one JSON message; the response (if
//! the dispatcher produced one) is written back and the connection closed.
//! Connection failures are logged and never reach the accept loop or the
//! ledger.

use fs_err as fs;
use std::io::{self, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::dispatch::dispatch;
use crate::stats::StatsLedger;
use tally_daemon_protocol::{Envelope, Response, MAX_MESSAGE_BYTES};

const READ_CHUNK_SIZE: usize = 4096;
const READ_TIMEOUT_SECS: u64 = 10;
// Accept wakes up at this interval to observe the shutdown flag.
const ACCEPT_POLL: Duration = Duration::from_millis(200);

pub struct Server {
    listener: UnixListener,
    socket_path: PathBuf,
    ledger: Arc<StatsLedger>,
    shutdown: Arc<AtomicBool>,
}

impl Server {
    /// Binds the listening socket, replacing any stale socket file and
    /// restricting access to the owning user.
    pub fn bind(socket_path: &Path, ledger: Arc<StatsLedger>) -> io::Result<Self> {
        if let Some(parent) = socket_path.parent() {
            fs::create_dir_all(parent)?;
        }
        match fs::remove_file(socket_path) {
            Ok(()) => debug!(path = %socket_path.display(), "Removed stale socket"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }

        let listener = UnixListener::bind(socket_path)?;
        fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))?;
        listener.set_nonblocking(true)?;

        Ok(Self {
            listener,
            socket_path: socket_path.to_path_buf(),
            ledger,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// The flag the accept loop polls; signal handlers set it directly.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Runs the accept loop until shutdown is requested, then closes the
    /// listener and removes the socket file. In-flight connection threads
    /// are not awaited; a response racing shutdown may be lost.
    pub fn run(self) {
        while !self.shutdown.load(Ordering::SeqCst) {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    let ledger = Arc::clone(&self.ledger);
                    thread::spawn(move || handle_connection(stream, ledger));
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL);
                }
                Err(err) => {
                    warn!(error = %err, "Failed to accept connection");
                }
            }
        }

        info!("Shutting down");
        drop(self.listener);
        match fs::remove_file(&self.socket_path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(error = %err, "Failed to remove socket file"),
        }
    }
}

fn handle_connection(mut stream: UnixStream, ledger: Arc<StatsLedger>) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(READ_TIMEOUT_SECS)));

    let envelope = match read_message(&mut stream) {
        Ok(Some(envelope)) => envelope,
        Ok(None) => return,
        Err(err) => {
            warn!(error = %err, "Failed to read message");
            return;
        }
    };

    debug!(
        method = %envelope.method_label(),
        notification = envelope.is_notification(),
        "Message received"
    );

    if let Some(response) = dispatch(&ledger, envelope) {
        if let Err(err) = write_response(&mut stream, &response) {
            warn!(error = %err, "Failed to write response");
        }
    }
}

/// Accumulates bytes until the buffer parses as one JSON value. A parse
/// failure means "incomplete", not an error; the peer closing the connection
/// ends the attempt. Anything past the first parseable value is never read.
fn read_message(stream: &mut UnixStream) -> io::Result<Option<Envelope>> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        let n = match stream.read(&mut chunk) {
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                warn!("Timed out waiting for a complete message");
                return Ok(None);
            }
            Err(err) => return Err(err),
        };

        if n == 0 {
            if !buffer.is_empty() {
                warn!(
                    bytes = buffer.len(),
                    "Connection closed before a complete message arrived"
                );
            }
            return Ok(None);
        }

        buffer.extend_from_slice(&chunk[..n]);
        if buffer.len() > MAX_MESSAGE_BYTES {
            warn!("Message exceeded maximum size; dropping connection");
            return Ok(None);
        }

        if let Ok(value) = serde_json::from_slice::<serde_json::Value>(&buffer) {
            if !value.is_object() {
                warn!("Message was not a JSON object; dropping connection");
                return Ok(None);
            }
            // Every envelope field is an optional Value, so any object converts.
            return Ok(serde_json::from_value(value).ok());
        }
    }
}

fn write_response(stream: &mut UnixStream, response: &Response) -> io::Result<()> {
    serde_json::to_writer(&mut *stream, response)?;
    stream.flush()
}
