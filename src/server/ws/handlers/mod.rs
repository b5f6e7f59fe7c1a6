//! RPC method dispatch.
//!
//! Every handler returns `Result<Value, ErrorShape>`; the message loop
//! turns that into an `rpc.res` frame. Handlers never panic the hub.

pub(crate) mod exec;
pub(crate) mod node;
pub(crate) mod sessions;

use serde_json::{json, Value};

use super::{now_ms, ConnectionContext, WsServerState, ERROR_INVALID_REQUEST};
use crate::gateway::ErrorPayload;

pub use node::HubNodeHost;

/// Methods the hub dispatches.
pub(crate) const GATEWAY_METHODS: [&str; 17] = [
    "health",
    "status",
    "node.list",
    "node.describe",
    "node.invoke",
    "node.invoke.result",
    "node.event",
    "session.list",
    "session.status",
    "session.patch",
    "session.reset",
    "chat.send",
    "exec.approval.request",
    "exec.approval.resolve",
    "last-heartbeat",
    "set-heartbeats",
    "wake",
];

/// Events the hub emits.
pub(crate) const GATEWAY_EVENTS: [&str; 9] = [
    "chat",
    "presence",
    "tick",
    "health",
    "heartbeat",
    "node.invoke.request",
    "node.event",
    "exec.approval.requested",
    "exec.approval.resolved",
];

/// Error block handed back from a handler.
#[derive(Debug, Clone)]
pub struct ErrorShape {
    pub code: &'static str,
    pub message: String,
    pub details: Option<Value>,
}

impl ErrorShape {
    pub(crate) fn into_payload(self) -> ErrorPayload {
        ErrorPayload {
            code: self.code.to_string(),
            message: self.message,
            retryable: None,
            details: self.details,
        }
    }
}

/// Build an error shape.
pub fn error_shape(code: &'static str, message: &str, details: Option<Value>) -> ErrorShape {
    ErrorShape {
        code,
        message: message.to_string(),
        details,
    }
}

/// Dispatch one RPC method. Unknown methods fail with `INVALID_REQUEST`.
pub(crate) async fn dispatch_method(
    method: &str,
    params: Option<&Value>,
    state: &std::sync::Arc<WsServerState>,
    conn: &ConnectionContext,
) -> Result<Value, ErrorShape> {
    match method {
        "health" => handle_health(state),
        "status" => handle_status(state),

        "node.list" => node::handle_node_list(state),
        "node.describe" => node::handle_node_describe(params, state),
        "node.invoke" => node::handle_node_invoke(params, state).await,
        "node.invoke.result" => node::handle_node_invoke_result(params, state, conn),
        "node.event" => node::handle_node_event(params, state, conn),

        "session.list" => sessions::handle_session_list(params, state),
        "session.status" => sessions::handle_session_status(params, state),
        "session.patch" => sessions::handle_session_patch(params, state),
        "session.reset" => sessions::handle_session_reset(params, state),
        "chat.send" => sessions::handle_chat_send(params, state),

        "exec.approval.request" => exec::handle_exec_approval_request(params, state).await,
        "exec.approval.resolve" => exec::handle_exec_approval_resolve(params, state, conn),

        "last-heartbeat" => handle_last_heartbeat(state),
        "set-heartbeats" => handle_set_heartbeats(params, state),
        "wake" => handle_wake(params, state),

        other => Err(error_shape(
            ERROR_INVALID_REQUEST,
            "unknown method",
            Some(json!({ "method": other })),
        )),
    }
}

fn handle_health(state: &WsServerState) -> Result<Value, ErrorShape> {
    let snapshot = state.health_snapshot();
    Ok(serde_json::to_value(snapshot).unwrap_or(json!({})))
}

fn handle_status(state: &WsServerState) -> Result<Value, ErrorShape> {
    let health = state.health_snapshot();
    Ok(json!({
        "ts": now_ms(),
        "version": env!("CARGO_PKG_VERSION"),
        "health": health,
        "nodes": state.node_registry.list_connected().len(),
        "execSessions": state.exec_engine.registry().list().len(),
    }))
}

fn handle_last_heartbeat(state: &WsServerState) -> Result<Value, ErrorShape> {
    let (enabled, interval_ms, last) = state.heartbeat_settings();
    Ok(json!({
        "enabled": enabled,
        "intervalMs": interval_ms,
        "lastHeartbeatMs": last,
    }))
}

fn handle_set_heartbeats(
    params: Option<&Value>,
    state: &WsServerState,
) -> Result<Value, ErrorShape> {
    let enabled = params
        .and_then(|v| v.get("enabled"))
        .and_then(|v| v.as_bool())
        .ok_or_else(|| error_shape(ERROR_INVALID_REQUEST, "enabled is required", None))?;
    let interval_ms = params
        .and_then(|v| v.get("intervalMs"))
        .and_then(|v| v.as_u64())
        .unwrap_or(30_000);
    let (enabled, interval_ms) = state.set_heartbeat_settings(enabled, interval_ms);
    Ok(json!({ "enabled": enabled, "intervalMs": interval_ms }))
}

fn handle_wake(params: Option<&Value>, state: &WsServerState) -> Result<Value, ErrorShape> {
    let reason = params
        .and_then(|v| v.get("reason"))
        .and_then(|v| v.as_str())
        .unwrap_or("manual");
    let text = params
        .and_then(|v| v.get("text"))
        .and_then(|v| v.as_str())
        .map(|s| s.trim())
        .filter(|s| !s.is_empty());
    if let Some(text) = text {
        state.enqueue_system_event(super::SystemEvent {
            ts: now_ms(),
            text: text.to_string(),
            session_key: None,
        });
    }
    let ts = state.wake(reason);
    Ok(json!({ "ts": ts, "reason": reason }))
}
