//! Node handlers: listing, invoke routing, and result correlation.

use serde_json::{json, Value};
use std::sync::{Arc, Weak};
use std::time::Duration;
use uuid::Uuid;

use super::{error_shape, ErrorShape};
use crate::exec::executor::{NodeCommandHost, NodeHostInfo, NodeRunOutput};
use crate::nodes::{BeginInvoke, NodeInvokeError, NodeInvokeResult, DEFAULT_INVOKE_TIMEOUT_MS};
use crate::server::ws::{
    now_ms, ConnectionContext, WsServerState, ERROR_INVALID_REQUEST, ERROR_NOT_PAIRED,
    ERROR_UNAVAILABLE,
};

pub(crate) fn handle_node_list(state: &WsServerState) -> Result<Value, ErrorShape> {
    let mut nodes: Vec<Value> = state
        .node_registry
        .list_connected()
        .into_iter()
        .map(|node| {
            let mut commands: Vec<String> = node.commands.iter().cloned().collect();
            commands.sort();
            json!({
                "nodeId": node.node_id,
                "displayName": node.display_name,
                "platform": node.platform,
                "commands": commands,
                "remoteIp": node.remote_ip,
                "connectedAtMs": node.connected_at_ms,
                "lastSeenMs": node.last_seen_ms,
                "connected": true,
            })
        })
        .collect();
    nodes.sort_by(|a, b| {
        a["nodeId"]
            .as_str()
            .unwrap_or_default()
            .cmp(b["nodeId"].as_str().unwrap_or_default())
    });
    Ok(json!({ "ts": now_ms(), "nodes": nodes }))
}

pub(crate) fn handle_node_describe(
    params: Option<&Value>,
    state: &WsServerState,
) -> Result<Value, ErrorShape> {
    let node_id = params
        .and_then(|v| v.get("nodeId"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| error_shape(ERROR_INVALID_REQUEST, "nodeId is required", None))?;
    let node = state
        .node_registry
        .get(node_id)
        .ok_or_else(|| error_shape(ERROR_INVALID_REQUEST, "unknown nodeId", None))?;
    let mut commands: Vec<String> = node.commands.iter().cloned().collect();
    commands.sort();
    Ok(json!({
        "ts": now_ms(),
        "nodeId": node.node_id,
        "displayName": node.display_name,
        "platform": node.platform,
        "commands": commands,
        "remoteIp": node.remote_ip,
        "connectedAtMs": node.connected_at_ms,
        "lastSeenMs": node.last_seen_ms,
        "connected": true,
    }))
}

/// Shared invoke path: open or join the ticket, forward the request frame,
/// and await the node's result under the deadline.
pub(crate) async fn invoke_node(
    state: &Arc<WsServerState>,
    node_id: &str,
    command: &str,
    params: Option<Value>,
    idempotency_key: &str,
    timeout_ms: u64,
) -> Result<NodeInvokeResult, ErrorShape> {
    state
        .node_registry
        .command_allowed(node_id, command)
        .map_err(|message| {
            let code = if message.contains("not connected") {
                ERROR_UNAVAILABLE
            } else {
                ERROR_INVALID_REQUEST
            };
            error_shape(
                code,
                &message,
                Some(json!({ "nodeId": node_id, "command": command })),
            )
        })?;

    // Tickets are abandoned on failure only by the caller that opened them;
    // attached callers leave the owner's deadline in charge.
    let mut owned_ticket: Option<String> = None;
    let receiver = match state
        .node_registry
        .begin_invoke(node_id, command, idempotency_key)
    {
        BeginInvoke::Replay(result) => return Ok(result),
        BeginInvoke::Attach { receiver, .. } => receiver,
        BeginInvoke::Send {
            ticket_id,
            receiver,
        } => {
            let conn_id = state.node_registry.conn_id_for(node_id).ok_or_else(|| {
                state.node_registry.abandon_invoke(&ticket_id);
                error_shape(ERROR_UNAVAILABLE, "node not connected", None)
            })?;
            let params_json = params
                .as_ref()
                .map(|p| serde_json::to_string(p).unwrap_or_default());
            let mut payload = serde_json::Map::new();
            payload.insert("id".to_string(), json!(ticket_id));
            payload.insert("nodeId".to_string(), json!(node_id));
            payload.insert("command".to_string(), json!(command));
            payload.insert("idempotencyKey".to_string(), json!(idempotency_key));
            if let Some(params) = params {
                payload.insert("params".to_string(), params);
            }
            if let Some(params_json) = params_json {
                payload.insert("paramsJSON".to_string(), json!(params_json));
            }
            if !state.send_event_to_connection(
                &conn_id,
                "node.invoke.request",
                Value::Object(payload),
            ) {
                state.node_registry.abandon_invoke(&ticket_id);
                return Err(error_shape(
                    ERROR_UNAVAILABLE,
                    "failed to send invoke to node",
                    Some(json!({ "nodeId": node_id, "command": command })),
                ));
            }
            owned_ticket = Some(ticket_id);
            receiver
        }
    };

    match tokio::time::timeout(Duration::from_millis(timeout_ms), receiver).await {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(_)) => Err(error_shape(
            ERROR_UNAVAILABLE,
            "node invoke failed",
            Some(json!({ "nodeId": node_id, "command": command })),
        )),
        Err(_) => {
            if let Some(ticket_id) = owned_ticket {
                state.node_registry.abandon_invoke(&ticket_id);
            }
            Err(error_shape(
                ERROR_UNAVAILABLE,
                "node invoke timed out",
                Some(json!({ "code": "TIMEOUT", "nodeId": node_id, "command": command })),
            ))
        }
    }
}

pub(crate) async fn handle_node_invoke(
    params: Option<&Value>,
    state: &Arc<WsServerState>,
) -> Result<Value, ErrorShape> {
    let params =
        params.ok_or_else(|| error_shape(ERROR_INVALID_REQUEST, "params required", None))?;
    let node_id = params
        .get("nodeId")
        .and_then(|v| v.as_str())
        .ok_or_else(|| error_shape(ERROR_INVALID_REQUEST, "nodeId is required", None))?;
    let command = params
        .get("command")
        .and_then(|v| v.as_str())
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| error_shape(ERROR_INVALID_REQUEST, "command is required", None))?;
    let idempotency_key = params
        .get("idempotencyKey")
        .and_then(|v| v.as_str())
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| error_shape(ERROR_INVALID_REQUEST, "idempotencyKey is required", None))?;
    let timeout_ms = params
        .get("timeoutMs")
        .and_then(|v| v.as_u64())
        .unwrap_or(DEFAULT_INVOKE_TIMEOUT_MS);
    let invoke_params = params.get("params").cloned();

    let result = invoke_node(
        state,
        node_id,
        command,
        invoke_params,
        idempotency_key,
        timeout_ms,
    )
    .await?;

    if !result.ok {
        let error = result.error.unwrap_or(NodeInvokeError {
            code: None,
            message: None,
        });
        return Err(error_shape(
            ERROR_UNAVAILABLE,
            error.message.as_deref().unwrap_or("node invoke failed"),
            Some(json!({
                "nodeId": node_id,
                "command": command,
                "nodeError": { "code": error.code, "message": error.message }
            })),
        ));
    }

    let payload = result
        .payload_json
        .as_deref()
        .map(|pj| serde_json::from_str(pj).unwrap_or(Value::Null))
        .unwrap_or(Value::Null);
    Ok(json!({
        "ok": true,
        "nodeId": node_id,
        "command": command,
        "payload": payload,
        "payloadJSON": result.payload_json,
    }))
}

/// Nodes report invoke results through this method.
pub(crate) fn handle_node_invoke_result(
    params: Option<&Value>,
    state: &WsServerState,
    conn: &ConnectionContext,
) -> Result<Value, ErrorShape> {
    if conn.role != "node" {
        return Err(error_shape(
            ERROR_INVALID_REQUEST,
            "only node connections can send invoke results",
            None,
        ));
    }
    let invoke_id = params
        .and_then(|v| v.get("id"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| error_shape(ERROR_INVALID_REQUEST, "id is required", None))?;
    let node_id = params
        .and_then(|v| v.get("nodeId"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| error_shape(ERROR_INVALID_REQUEST, "nodeId is required", None))?;

    let caller_node_id = conn
        .instance_id
        .clone()
        .unwrap_or_else(|| conn.client_name.clone());
    if caller_node_id != node_id {
        return Err(error_shape(ERROR_INVALID_REQUEST, "nodeId mismatch", None));
    }
    if state.node_registry.get(node_id).is_none() {
        return Err(error_shape(ERROR_NOT_PAIRED, "node not paired", None));
    }
    state.node_registry.touch(node_id);

    let ok = params
        .and_then(|v| v.get("ok"))
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let payload_json = params
        .and_then(|v| v.get("payloadJSON"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .or_else(|| {
            params
                .and_then(|v| v.get("payload"))
                .filter(|v| !v.is_null())
                .map(|v| v.to_string())
        });
    let error = params
        .and_then(|v| v.get("error"))
        .and_then(|v| v.as_object())
        .map(|err| NodeInvokeError {
            code: err.get("code").and_then(|v| v.as_str()).map(String::from),
            message: err
                .get("message")
                .and_then(|v| v.as_str())
                .map(String::from),
        });

    let resolved = state.node_registry.resolve_invoke(
        invoke_id,
        node_id,
        NodeInvokeResult {
            ok,
            payload_json,
            error,
        },
    );
    if !resolved {
        return Ok(json!({ "ok": true, "ignored": true }));
    }
    Ok(json!({ "ok": true }))
}

/// Nodes emit free-form events that fan out to operators.
pub(crate) fn handle_node_event(
    params: Option<&Value>,
    state: &WsServerState,
    conn: &ConnectionContext,
) -> Result<Value, ErrorShape> {
    if conn.role != "node" {
        return Err(error_shape(
            ERROR_INVALID_REQUEST,
            "only node connections can send events",
            None,
        ));
    }
    let caller_node_id = conn
        .instance_id
        .clone()
        .unwrap_or_else(|| conn.client_name.clone());
    let node_id = params
        .and_then(|v| v.get("nodeId"))
        .and_then(|v| v.as_str())
        .unwrap_or(&caller_node_id);
    if node_id != caller_node_id {
        return Err(error_shape(ERROR_INVALID_REQUEST, "nodeId mismatch", None));
    }
    let event = params
        .and_then(|v| v.get("event"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| error_shape(ERROR_INVALID_REQUEST, "event is required", None))?;
    let payload = params.and_then(|v| v.get("payload")).cloned();

    state.node_registry.touch(node_id);
    state.broadcast_event(
        "node.event",
        json!({
            "nodeId": node_id,
            "event": event,
            "payload": payload.unwrap_or(Value::Null),
            "ts": now_ms(),
        }),
    );
    Ok(json!({ "ok": true, "nodeId": node_id, "event": event }))
}

/// The exec engine's bridge onto the invoke router.
pub struct HubNodeHost {
    state: Weak<WsServerState>,
}

impl HubNodeHost {
    pub fn new(state: Weak<WsServerState>) -> Self {
        Self { state }
    }
}

#[async_trait::async_trait]
impl NodeCommandHost for HubNodeHost {
    fn list_nodes(&self) -> Vec<NodeHostInfo> {
        let Some(state) = self.state.upgrade() else {
            return Vec::new();
        };
        state
            .node_registry
            .list_connected()
            .into_iter()
            .map(|node| NodeHostInfo {
                node_id: node.node_id,
                platform: node.platform,
                commands: node.commands.into_iter().collect(),
            })
            .collect()
    }

    async fn run_command(
        &self,
        node_id: &str,
        argv: Vec<String>,
        timeout_ms: u64,
    ) -> Result<NodeRunOutput, String> {
        let state = self
            .state
            .upgrade()
            .ok_or_else(|| "gateway shutting down".to_string())?;
        // Each exec run is its own invocation; a fresh key avoids dedup.
        let idempotency_key = Uuid::new_v4().to_string();
        let result = invoke_node(
            &state,
            node_id,
            "system.run",
            Some(json!({ "argv": argv })),
            &idempotency_key,
            timeout_ms,
        )
        .await
        .map_err(|e| e.message)?;

        if !result.ok {
            let message = result
                .error
                .and_then(|e| e.message)
                .unwrap_or_else(|| "system.run failed".to_string());
            return Err(message);
        }
        let payload: Value = result
            .payload_json
            .as_deref()
            .map(|pj| serde_json::from_str(pj).unwrap_or(Value::Null))
            .unwrap_or(Value::Null);
        Ok(NodeRunOutput {
            exit_code: payload
                .get("exitCode")
                .and_then(|v| v.as_i64())
                .unwrap_or(0) as i32,
            stdout: payload
                .get("stdout")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            stderr: payload
                .get("stderr")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::NodeSession;
    use crate::server::ws::tests::test_state;
    use tempfile::TempDir;

    fn register_node(state: &Arc<WsServerState>, node_id: &str, commands: &[&str]) {
        state.node_registry.register(NodeSession {
            node_id: node_id.to_string(),
            conn_id: format!("conn-{node_id}"),
            display_name: Some(node_id.to_string()),
            platform: Some("mac".to_string()),
            commands: commands.iter().map(|c| c.to_string()).collect(),
            remote_ip: None,
            connected_at_ms: now_ms(),
            last_seen_ms: None,
        });
    }

    fn node_conn(node_id: &str) -> ConnectionContext {
        ConnectionContext {
            conn_id: format!("conn-{node_id}"),
            role: "node".to_string(),
            client_name: node_id.to_string(),
            instance_id: Some(node_id.to_string()),
        }
    }

    #[tokio::test]
    async fn test_node_list_and_describe() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        register_node(&state, "mac-1", &["system.run", "canvas.snapshot"]);

        let list = handle_node_list(&state).unwrap();
        assert_eq!(list["nodes"].as_array().unwrap().len(), 1);
        assert_eq!(list["nodes"][0]["nodeId"], "mac-1");

        let described = handle_node_describe(Some(&json!({ "nodeId": "mac-1" })), &state).unwrap();
        assert_eq!(described["platform"], "mac");
        assert!(handle_node_describe(Some(&json!({ "nodeId": "ghost" })), &state).is_err());
    }

    #[tokio::test]
    async fn test_invoke_rejects_undeclared_command() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        register_node(&state, "mac-1", &["canvas.snapshot"]);

        let err = handle_node_invoke(
            Some(&json!({
                "nodeId": "mac-1",
                "command": "system.run",
                "idempotencyKey": "k1",
            })),
            &state,
        )
        .await
        .unwrap_err();
        assert!(err.message.contains("node command not allowed"));
    }

    #[tokio::test]
    async fn test_invoke_round_trip_with_null_payload() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        register_node(&state, "mac-1", &["canvas.snapshot"]);

        // No real socket for the node conn; the send will fail, so resolve
        // the ticket through the registry directly to model the node reply.
        let invoke_state = Arc::clone(&state);
        let invoke = tokio::spawn(async move {
            handle_node_invoke(
                Some(&json!({
                    "nodeId": "mac-1",
                    "command": "canvas.snapshot",
                    "idempotencyKey": "k2",
                    "timeoutMs": 2_000,
                })),
                &invoke_state,
            )
            .await
        });

        // The send fails because conn-mac-1 has no channel; expect an
        // UNAVAILABLE error rather than a hang.
        let result = invoke.await.unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_invoke_result_requires_node_role_and_identity() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        register_node(&state, "mac-1", &["canvas.snapshot"]);

        let operator = ConnectionContext {
            conn_id: "op".to_string(),
            role: "chat-ui".to_string(),
            client_name: "ui".to_string(),
            instance_id: None,
        };
        let err = handle_node_invoke_result(
            Some(&json!({ "id": "x", "nodeId": "mac-1", "ok": true })),
            &state,
            &operator,
        )
        .unwrap_err();
        assert!(err.message.contains("only node connections"));

        let wrong_identity = node_conn("other-node");
        let err = handle_node_invoke_result(
            Some(&json!({ "id": "x", "nodeId": "mac-1", "ok": true })),
            &state,
            &wrong_identity,
        )
        .unwrap_err();
        assert_eq!(err.message, "nodeId mismatch");
    }

    #[tokio::test]
    async fn test_invoke_result_resolves_pending_ticket() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        register_node(&state, "mac-1", &["canvas.snapshot"]);

        let BeginInvoke::Send {
            ticket_id,
            receiver,
        } = state
            .node_registry
            .begin_invoke("mac-1", "canvas.snapshot", "k3")
        else {
            panic!("expected Send");
        };

        let result = handle_node_invoke_result(
            Some(&json!({
                "id": ticket_id,
                "nodeId": "mac-1",
                "ok": true,
                "payloadJSON": Value::Null,
            })),
            &state,
            &node_conn("mac-1"),
        )
        .unwrap();
        assert_eq!(result["ok"], true);
        assert!(result.get("ignored").is_none());

        let resolved = receiver.await.unwrap();
        assert!(resolved.ok);
        assert!(resolved.payload_json.is_none());

        // A second result for the same ticket is ignored.
        let result = handle_node_invoke_result(
            Some(&json!({ "id": "unknown", "nodeId": "mac-1", "ok": true })),
            &state,
            &node_conn("mac-1"),
        )
        .unwrap();
        assert_eq!(result["ignored"], true);
    }

    #[tokio::test]
    async fn test_node_event_broadcasts() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        register_node(&state, "mac-1", &["canvas.snapshot"]);

        let result = handle_node_event(
            Some(&json!({ "event": "battery", "payload": { "pct": 80 } })),
            &state,
            &node_conn("mac-1"),
        )
        .unwrap();
        assert_eq!(result["ok"], true);
        assert_eq!(result["nodeId"], "mac-1");
    }
}
