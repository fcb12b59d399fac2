//! IPC protocol types for the Tally daemon.
//!
//! This crate is shared by the daemon and its clients to prevent schema drift.
//! The wire format is JSON-RPC 2.0: one JSON document per connection, a
//! response only when the message carries an `id`. The daemon remains the
//! authority on validation, but clients can reuse the same types to construct
//! valid messages.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::env;
use std::path::PathBuf;

pub const PROTOCOL_MARKER: &str = "2.0";
pub const MAX_MESSAGE_BYTES: usize = 1024 * 1024; // 1MB

pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INTERNAL_ERROR: i64 = -32603;

pub const SOCKET_ENV: &str = "TALLY_SOCKET";
const SOCKET_DIR: &str = ".tally";
const SOCKET_NAME: &str = "daemon.sock";

/// Default socket location: `$TALLY_SOCKET` if set, else `~/.tally/daemon.sock`.
pub fn default_socket_path() -> Result<PathBuf, String> {
    if let Ok(path) = env::var(SOCKET_ENV) {
        return Ok(PathBuf::from(path));
    }
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(SOCKET_DIR).join(SOCKET_NAME))
}

/// The methods the daemon answers. Anything else is rejected with
/// `METHOD_NOT_FOUND` rather than matched open-endedly on strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    OnEvent,
    GetStats,
    ResetStats,
    HealthCheck,
}

impl Method {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "on_event" => Some(Method::OnEvent),
            "get_stats" => Some(Method::GetStats),
            "reset_stats" => Some(Method::ResetStats),
            "health_check" => Some(Method::HealthCheck),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Method::OnEvent => "on_event",
            Method::GetStats => "get_stats",
            Method::ResetStats => "reset_stats",
            Method::HealthCheck => "health_check",
        }
    }
}

/// Event tags consumed via `on_event`. The host emits more tags than we
/// track; `Other` keeps unknown ones from ever being an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    ToolCallStart,
    ToolCallEnd,
    AgentStart,
    TodoUpdate,
    ContextUsageUpdate,
    Other,
}

impl EventType {
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "TOOL_CALL_START" => EventType::ToolCallStart,
            "TOOL_CALL_END" => EventType::ToolCallEnd,
            "AGENT_START" => EventType::AgentStart,
            "TODO_UPDATE" => EventType::TodoUpdate,
            "CONTEXT_USAGE_UPDATE" => EventType::ContextUsageUpdate,
            _ => EventType::Other,
        }
    }
}

/// The outer structure of a wire message.
///
/// Fields stay raw `Value`s on purpose: a message with a mistyped marker or
/// method must surface as a protocol error response, not as a deserialization
/// failure that silently drops the connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

impl Envelope {
    pub fn request(method: Method, params: Option<Value>, id: Value) -> Self {
        Self {
            jsonrpc: Some(Value::String(PROTOCOL_MARKER.to_string())),
            method: Some(Value::String(method.name().to_string())),
            params,
            id: Some(id),
        }
    }

    pub fn notification(method: Method, params: Option<Value>) -> Self {
        Self {
            jsonrpc: Some(Value::String(PROTOCOL_MARKER.to_string())),
            method: Some(Value::String(method.name().to_string())),
            params,
            id: None,
        }
    }

    pub fn marker_is_valid(&self) -> bool {
        self.jsonrpc
            .as_ref()
            .and_then(Value::as_str)
            .is_some_and(|marker| marker == PROTOCOL_MARKER)
    }

    /// A JSON `null` id counts as absent: no response is owed.
    pub fn is_notification(&self) -> bool {
        matches!(self.id, None | Some(Value::Null))
    }

    pub fn method_name(&self) -> Option<&str> {
        self.method.as_ref().and_then(Value::as_str)
    }

    /// Renders the method field for error messages, whatever JSON type the
    /// sender used for it.
    pub fn method_label(&self) -> String {
        match &self.method {
            None => "null".to_string(),
            Some(Value::String(name)) => name.clone(),
            Some(other) => other.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcError {
    pub fn invalid_request() -> Self {
        Self {
            code: INVALID_REQUEST,
            message: format!("Invalid Request: jsonrpc must be \"{}\"", PROTOCOL_MARKER),
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self {
            code: METHOD_NOT_FOUND,
            message: format!("Method not found: {}", method),
        }
    }

    pub fn internal(detail: impl std::fmt::Display) -> Self {
        Self {
            code: INTERNAL_ERROR,
            message: format!("Internal error: {}", detail),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: Value,
}

impl Response {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: PROTOCOL_MARKER.to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: Value, error: RpcError) -> Self {
        Self {
            jsonrpc: PROTOCOL_MARKER.to_string(),
            result: None,
            error: Some(error),
            id,
        }
    }
}
