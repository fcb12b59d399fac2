//! Client helper for talking to the Tally daemon socket.
//!
//! One message per connection: write a single JSON document, then read the
//! whole response for requests, or nothing at all for notifications. The
//! daemon signals end-of-response by closing the connection.

use chrono::Utc;
use serde_json::Value;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use tally_daemon_protocol::{Envelope, Method, Response, RpcError, MAX_MESSAGE_BYTES};

const READ_TIMEOUT_MS: u64 = 2000;
const WRITE_TIMEOUT_MS: u64 = 600;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to daemon socket: {0}")]
    Connect(#[source] std::io::Error),
    #[error("failed to send message: {0}")]
    Send(#[source] std::io::Error),
    #[error("failed to read response: {0}")]
    Read(#[source] std::io::Error),
    #[error("timed out waiting for daemon response")]
    Timeout,
    #[error("daemon closed the connection without a response")]
    Empty,
    #[error("response was not valid JSON: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("event data is not valid JSON: {0}")]
    InvalidEventData(#[source] serde_json::Error),
    #[error("daemon error {}: {}", .0.code, .0.message)]
    Rpc(RpcError),
}

pub struct DaemonClient {
    socket_path: PathBuf,
}

impl DaemonClient {
    pub fn new(socket_path: PathBuf) -> Self {
        Self { socket_path }
    }

    /// Sends a request and waits for the matching response's result value.
    pub fn request(&self, method: Method, params: Option<Value>) -> Result<Value, ClientError> {
        let envelope = Envelope::request(method, params, Value::String(make_request_id()));
        let mut stream = self.connect()?;
        write_message(&mut stream, &envelope)?;

        let response = read_response(&mut stream)?;
        if let Some(error) = response.error {
            return Err(ClientError::Rpc(error));
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    /// Sends a notification; the daemon never answers these.
    pub fn notify(&self, method: Method, params: Option<Value>) -> Result<(), ClientError> {
        let envelope = Envelope::notification(method, params);
        let mut stream = self.connect()?;
        write_message(&mut stream, &envelope)
    }

    pub fn emit_event(&self, event_type: &str, event_data: Value) -> Result<(), ClientError> {
        self.notify(
            Method::OnEvent,
            Some(serde_json::json!({
                "event_type": event_type,
                "event_data": event_data,
            })),
        )
    }

    fn connect(&self) -> Result<UnixStream, ClientError> {
        let stream = UnixStream::connect(&self.socket_path).map_err(ClientError::Connect)?;
        let _ = stream.set_read_timeout(Some(Duration::from_millis(READ_TIMEOUT_MS)));
        let _ = stream.set_write_timeout(Some(Duration::from_millis(WRITE_TIMEOUT_MS)));
        Ok(stream)
    }
}

fn make_request_id() -> String {
    format!(
        "req-{}-{}",
        std::process::id(),
        Utc::now().timestamp_millis()
    )
}

fn write_message(stream: &mut UnixStream, envelope: &Envelope) -> Result<(), ClientError> {
    let payload = serde_json::to_vec(envelope).map_err(|err| ClientError::Send(err.into()))?;
    stream.write_all(&payload).map_err(ClientError::Send)?;
    stream.flush().map_err(ClientError::Send)?;
    // Half-close marks end-of-message so the daemon stops reading at once.
    stream
        .shutdown(std::net::Shutdown::Write)
        .map_err(ClientError::Send)?;
    Ok(())
}

fn read_response(stream: &mut UnixStream) -> Result<Response, ClientError> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_MESSAGE_BYTES {
                    return Err(ClientError::Read(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "response exceeded maximum size",
                    )));
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                return Err(ClientError::Timeout)
            }
            Err(err) => return Err(ClientError::Read(err)),
        }
    }

    if buffer.is_empty() {
        return Err(ClientError::Empty);
    }
    serde_json::from_slice(&buffer).map_err(ClientError::Malformed)
}
