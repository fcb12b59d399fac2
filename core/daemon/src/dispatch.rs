//! Stateless routing of parsed envelopes.
//!
//! Requests produce exactly one response; notifications never produce one,
//! even when their payload is unusable. Handler failures become error values
//! here, so nothing below the connection boundary can panic the handler
//! thread.

use serde_json::{json, Value};
use tracing::warn;

use crate::stats::StatsLedger;
use tally_daemon_protocol::{Envelope, Method, Response, RpcError};

pub fn dispatch(ledger: &StatsLedger, envelope: Envelope) -> Option<Response> {
    if !envelope.marker_is_valid() {
        let id = envelope.id.clone().unwrap_or(Value::Null);
        return Some(Response::error(id, RpcError::invalid_request()));
    }

    if envelope.is_notification() {
        // Only on_event means anything as a notification; anything else is
        // silently ignored because there is no channel to report on.
        if envelope.method_name().and_then(Method::from_name) == Some(Method::OnEvent) {
            forward_event(ledger, envelope.params.as_ref());
        }
        return None;
    }

    let id = envelope.id.clone().unwrap_or(Value::Null);
    let result = match envelope.method_name().and_then(Method::from_name) {
        Some(Method::GetStats) => {
            serde_json::to_value(ledger.snapshot()).map_err(RpcError::internal)
        }
        Some(Method::ResetStats) => {
            serde_json::to_value(ledger.reset()).map_err(RpcError::internal)
        }
        Some(Method::HealthCheck) => Ok(json!({ "status": "healthy" })),
        // on_event is notification-only; with an id it is not a callable method.
        Some(Method::OnEvent) | None => Err(RpcError::method_not_found(&envelope.method_label())),
    };

    Some(match result {
        Ok(value) => Response::success(id, value),
        Err(error) => Response::error(id, error),
    })
}

fn forward_event(ledger: &StatsLedger, params: Option<&Value>) {
    let event_type = params
        .and_then(|params| params.get("event_type"))
        .and_then(Value::as_str);
    let Some(event_type) = event_type else {
        warn!("Dropping on_event notification without a string event_type");
        return;
    };

    let default_data = json!({});
    let event_data = params
        .and_then(|params| params.get("event_data"))
        .unwrap_or(&default_data);
    ledger.apply(event_type, event_data);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_daemon_protocol::{INTERNAL_ERROR, INVALID_REQUEST, METHOD_NOT_FOUND};

    fn dispatch_value(ledger: &StatsLedger, message: Value) -> Option<Response> {
        let envelope = serde_json::from_value(message).expect("envelope parses");
        dispatch(ledger, envelope)
    }

    #[test]
    fn bad_marker_yields_invalid_request_echoing_id() {
        let ledger = StatsLedger::new();
        let response = dispatch_value(
            &ledger,
            json!({"jsonrpc": "1.0", "method": "get_stats", "id": 42}),
        )
        .expect("error response");
        let error = response.error.expect("error body");
        assert_eq!(error.code, INVALID_REQUEST);
        assert_eq!(response.id, json!(42));
        assert!(response.result.is_none());
    }

    #[test]
    fn missing_marker_yields_invalid_request_with_null_id() {
        let ledger = StatsLedger::new();
        let response =
            dispatch_value(&ledger, json!({"method": "get_stats"})).expect("error response");
        assert_eq!(response.error.expect("error body").code, INVALID_REQUEST);
        assert_eq!(response.id, Value::Null);
    }

    #[test]
    fn unknown_method_yields_method_not_found() {
        let ledger = StatsLedger::new();
        let response = dispatch_value(
            &ledger,
            json!({"jsonrpc": "2.0", "method": "shutdown", "id": "abc"}),
        )
        .expect("error response");
        let error = response.error.expect("error body");
        assert_eq!(error.code, METHOD_NOT_FOUND);
        assert_eq!(error.message, "Method not found: shutdown");
        assert_eq!(response.id, json!("abc"));
    }

    #[test]
    fn missing_method_renders_as_null_in_the_error() {
        let ledger = StatsLedger::new();
        let response =
            dispatch_value(&ledger, json!({"jsonrpc": "2.0", "id": 1})).expect("error response");
        assert_eq!(
            response.error.expect("error body").message,
            "Method not found: null"
        );
    }

    #[test]
    fn on_event_with_an_id_is_not_a_callable_method() {
        let ledger = StatsLedger::new();
        let response = dispatch_value(
            &ledger,
            json!({
                "jsonrpc": "2.0",
                "method": "on_event",
                "params": {"event_type": "TODO_UPDATE", "event_data": {}},
                "id": 5
            }),
        )
        .expect("error response");
        assert_eq!(response.error.expect("error body").code, METHOD_NOT_FOUND);
        // The request path must not have applied the event either.
        assert_eq!(ledger.snapshot().todo_updates, 0);
    }

    #[test]
    fn health_check_is_constant() {
        let ledger = StatsLedger::new();
        let response = dispatch_value(
            &ledger,
            json!({"jsonrpc": "2.0", "method": "health_check", "id": 9}),
        )
        .expect("response");
        assert_eq!(response.result, Some(json!({"status": "healthy"})));
        assert_eq!(response.id, json!(9));
        assert!(response.error.is_none());
    }

    #[test]
    fn notification_applies_event_and_returns_nothing() {
        let ledger = StatsLedger::new();
        let response = dispatch_value(
            &ledger,
            json!({
                "jsonrpc": "2.0",
                "method": "on_event",
                "params": {
                    "event_type": "TOOL_CALL_START",
                    "event_data": {"toolName": "calc"}
                }
            }),
        );
        assert!(response.is_none());
        assert_eq!(ledger.snapshot().tool_calls_total, 1);
    }

    #[test]
    fn null_id_is_treated_as_a_notification() {
        let ledger = StatsLedger::new();
        let response = dispatch_value(
            &ledger,
            json!({"jsonrpc": "2.0", "method": "get_stats", "id": null}),
        );
        assert!(response.is_none());
    }

    #[test]
    fn notification_with_other_method_is_ignored() {
        let ledger = StatsLedger::new();
        let response = dispatch_value(&ledger, json!({"jsonrpc": "2.0", "method": "get_stats"}));
        assert!(response.is_none());
    }

    #[test]
    fn notification_without_event_type_is_dropped() {
        let ledger = StatsLedger::new();
        assert!(dispatch_value(
            &ledger,
            json!({"jsonrpc": "2.0", "method": "on_event", "params": {}}),
        )
        .is_none());
        assert!(dispatch_value(
            &ledger,
            json!({"jsonrpc": "2.0", "method": "on_event", "params": {"event_type": 7}}),
        )
        .is_none());
        assert!(dispatch_value(
            &ledger,
            json!({"jsonrpc": "2.0", "method": "on_event", "params": "not an object"}),
        )
        .is_none());
        assert!(ledger.snapshot().last_event.is_none());
    }

    #[test]
    fn notification_without_event_data_defaults_to_empty_object() {
        let ledger = StatsLedger::new();
        dispatch_value(
            &ledger,
            json!({"jsonrpc": "2.0", "method": "on_event", "params": {"event_type": "TODO_UPDATE"}}),
        );
        assert_eq!(ledger.snapshot().todo_updates, 1);
    }

    #[test]
    fn notification_with_null_event_data_is_dropped() {
        let ledger = StatsLedger::new();
        dispatch_value(
            &ledger,
            json!({
                "jsonrpc": "2.0",
                "method": "on_event",
                "params": {"event_type": "TODO_UPDATE", "event_data": null}
            }),
        );
        assert_eq!(ledger.snapshot().todo_updates, 0);
    }

    #[test]
    fn get_stats_reflects_applied_events() {
        let ledger = StatsLedger::new();
        ledger.apply("TOOL_CALL_START", &json!({"toolName": "calc"}));
        ledger.apply("TOOL_CALL_END", &json!({"success": true}));

        let response = dispatch_value(
            &ledger,
            json!({"jsonrpc": "2.0", "method": "get_stats", "id": 1}),
        )
        .expect("response");
        let result = response.result.expect("stats result");
        assert_eq!(result.get("tool_calls_total"), Some(&json!(1)));
        assert_eq!(result.get("tool_calls_success"), Some(&json!(1)));
        assert_eq!(
            result.pointer("/tool_breakdown/calc"),
            Some(&json!(1))
        );
        assert_eq!(result.get("tool_success_rate"), Some(&json!(100.0)));
    }

    #[test]
    fn reset_stats_reports_previous_and_zeroes() {
        let ledger = StatsLedger::new();
        ledger.apply("TODO_UPDATE", &json!({}));

        let response = dispatch_value(
            &ledger,
            json!({"jsonrpc": "2.0", "method": "reset_stats", "id": 2}),
        )
        .expect("response");
        let result = response.result.expect("reset result");
        assert_eq!(result.get("reset"), Some(&json!(true)));
        assert_eq!(
            result.pointer("/previous_stats/todo_updates"),
            Some(&json!(1))
        );
        assert_eq!(ledger.snapshot().todo_updates, 0);
    }

    #[test]
    fn internal_error_code_is_reserved_for_handler_failures() {
        // The built-in handlers cannot fail to serialize, so this just pins
        // the code the conversion would use.
        assert_eq!(RpcError::internal("boom").code, INTERNAL_ERROR);
        assert_eq!(RpcError::internal("boom").message, "Internal error: boom");
    }
}
