//! Conversation statistics owned by the daemon.
//!
//! One ledger per process. Every connection thread shares it; a single mutex
//! guards all reads and writes, so a snapshot can never observe a partial
//! update. Malformed event payloads are logged and dropped, never surfaced
//! to the sender.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tally_daemon_protocol::EventType;
use tracing::warn;

#[derive(Debug, Clone, Serialize)]
pub struct LastEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    /// Echoes the event's own `timestamp` field verbatim; epoch seconds when
    /// the event carried none.
    pub timestamp: Value,
}

#[derive(Debug, Clone)]
struct Stats {
    tool_calls_total: u64,
    tool_calls_success: u64,
    tool_calls_failed: u64,
    agent_invocations: u64,
    subagent_invocations: u64,
    todo_updates: u64,
    current_context_usage: f64,
    session_start: DateTime<Utc>,
    last_event: Option<LastEvent>,
    tool_breakdown: HashMap<String, u64>,
}

impl Stats {
    fn new() -> Self {
        Self {
            tool_calls_total: 0,
            tool_calls_success: 0,
            tool_calls_failed: 0,
            agent_invocations: 0,
            subagent_invocations: 0,
            todo_updates: 0,
            current_context_usage: 0.0,
            session_start: Utc::now(),
            last_event: None,
            tool_breakdown: HashMap::new(),
        }
    }
}

/// Point-in-time copy of the statistics, plus derived fields. Owns its
/// breakdown map outright; later ledger updates cannot reach into it.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub tool_calls_total: u64,
    pub tool_calls_success: u64,
    pub tool_calls_failed: u64,
    pub agent_invocations: u64,
    pub subagent_invocations: u64,
    pub todo_updates: u64,
    pub current_context_usage: f64,
    pub session_start: DateTime<Utc>,
    pub last_event: Option<LastEvent>,
    pub tool_breakdown: HashMap<String, u64>,
    pub uptime_seconds: f64,
    pub tool_success_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResetOutcome {
    pub reset: bool,
    pub previous_stats: Snapshot,
}

pub struct StatsLedger {
    stats: Mutex<Stats>,
}

impl StatsLedger {
    pub fn new() -> Self {
        Self {
            stats: Mutex::new(Stats::new()),
        }
    }

    // Ledger operations are infallible from the caller's perspective. A
    // poisoned lock still holds consistent counters, so keep using them.
    fn locked(&self) -> MutexGuard<'_, Stats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies one event to the counters. Unknown tags update `last_event`
    /// and nothing else; non-object payloads are dropped entirely.
    pub fn apply(&self, event_type: &str, event_data: &Value) {
        let Some(data) = event_data.as_object() else {
            warn!(event_type, "Malformed event_data: expected an object");
            return;
        };

        let mut stats = self.locked();

        stats.last_event = Some(LastEvent {
            event_type: event_type.to_string(),
            timestamp: data.get("timestamp").cloned().unwrap_or_else(now_epoch),
        });

        match EventType::from_tag(event_type) {
            EventType::ToolCallStart => {
                stats.tool_calls_total += 1;
                let tool = data
                    .get("toolName")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                *stats.tool_breakdown.entry(tool.to_string()).or_insert(0) += 1;
            }
            EventType::ToolCallEnd => {
                // Start and end are uncorrelated events; this counts outcomes,
                // not specific calls.
                let success = data.get("success").and_then(Value::as_bool).unwrap_or(true);
                let result_error = data
                    .get("result")
                    .and_then(|result| result.get("error"))
                    .is_some_and(|error| !error.is_null());
                if success && !result_error {
                    stats.tool_calls_success += 1;
                } else {
                    stats.tool_calls_failed += 1;
                }
            }
            EventType::AgentStart => {
                let specialized = data
                    .get("isSpecializedAgent")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if specialized {
                    stats.subagent_invocations += 1;
                } else {
                    stats.agent_invocations += 1;
                }
            }
            EventType::TodoUpdate => {
                stats.todo_updates += 1;
            }
            EventType::ContextUsageUpdate => {
                stats.current_context_usage = data
                    .get("contextUsage")
                    .and_then(Value::as_f64)
                    .unwrap_or(0.0);
            }
            EventType::Other => {}
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        snapshot_of(&self.locked())
    }

    /// Replaces the live statistics with a zeroed set under one lock
    /// acquisition, returning what was there before.
    pub fn reset(&self) -> ResetOutcome {
        let mut stats = self.locked();
        let previous = snapshot_of(&stats);
        *stats = Stats::new();
        ResetOutcome {
            reset: true,
            previous_stats: previous,
        }
    }
}

impl Default for StatsLedger {
    fn default() -> Self {
        Self::new()
    }
}

fn snapshot_of(stats: &Stats) -> Snapshot {
    let uptime_seconds = (Utc::now() - stats.session_start).num_milliseconds() as f64 / 1000.0;
    let tool_success_rate = if stats.tool_calls_total > 0 {
        round2(stats.tool_calls_success as f64 / stats.tool_calls_total as f64 * 100.0)
    } else {
        0.0
    };
    Snapshot {
        tool_calls_total: stats.tool_calls_total,
        tool_calls_success: stats.tool_calls_success,
        tool_calls_failed: stats.tool_calls_failed,
        agent_invocations: stats.agent_invocations,
        subagent_invocations: stats.subagent_invocations,
        todo_updates: stats.todo_updates,
        current_context_usage: stats.current_context_usage,
        session_start: stats.session_start,
        last_event: stats.last_event.clone(),
        tool_breakdown: stats.tool_breakdown.clone(),
        uptime_seconds,
        tool_success_rate,
    }
}

fn now_epoch() -> Value {
    json!(Utc::now().timestamp_millis() as f64 / 1000.0)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
