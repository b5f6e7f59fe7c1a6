//! Exec approval RPCs.
//!
//! `exec.approval.request` registers a pending decision and waits;
//! `exec.approval.resolve` answers it from an operator connection. Both
//! sides share the engine's approval manager, so decisions arriving over
//! the approval socket and over the hub land in the same place.

use serde_json::{json, Value};
use std::sync::Arc;

use super::{error_shape, ErrorShape};
use crate::approvals::manager::ApprovalRequest;
use crate::approvals::ExecApprovalDecision;
use crate::server::ws::{now_ms, ConnectionContext, WsServerState, ERROR_INVALID_REQUEST};

/// Default wait for a decision (2 minutes).
const DEFAULT_APPROVAL_TIMEOUT_MS: u64 = 120_000;

pub(crate) async fn handle_exec_approval_request(
    params: Option<&Value>,
    state: &Arc<WsServerState>,
) -> Result<Value, ErrorShape> {
    let command = params
        .and_then(|v| v.get("command"))
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| error_shape(ERROR_INVALID_REQUEST, "command is required", None))?;
    let explicit_id = params
        .and_then(|v| v.get("id"))
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty());
    let timeout_ms = params
        .and_then(|v| v.get("timeoutMs"))
        .and_then(|v| v.as_u64())
        .unwrap_or(DEFAULT_APPROVAL_TIMEOUT_MS);

    let field = |key: &str| {
        params
            .and_then(|v| v.get(key))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    };
    let request = ApprovalRequest {
        command: command.to_string(),
        cwd: field("cwd"),
        host: field("host"),
        security: field("security"),
        ask: field("ask"),
        agent_id: field("agentId"),
        resolved_path: field("resolvedPath"),
        session_key: field("sessionKey"),
        timeout_ms: Some(timeout_ms),
    };

    let manager = state.exec_engine.approval_manager();
    let record = manager.create_record(request, timeout_ms, explicit_id);
    if manager.is_pending(&record.id) {
        return Err(error_shape(
            ERROR_INVALID_REQUEST,
            "approval id already pending",
            Some(json!({ "id": record.id })),
        ));
    }

    state.broadcast_event(
        "exec.approval.requested",
        serde_json::to_value(&record).unwrap_or(json!({})),
    );

    let id = record.id.clone();
    let created_at_ms = record.created_at_ms;
    let expires_at_ms = record.expires_at_ms;
    let decision = manager.wait_for_decision(record, timeout_ms).await;

    Ok(json!({
        "id": id,
        "command": command,
        "createdAtMs": created_at_ms,
        "expiresAtMs": expires_at_ms,
        "decision": decision.map(|d| d.as_str()),
        "status": if decision.is_some() { "resolved" } else { "timeout" },
    }))
}

pub(crate) fn handle_exec_approval_resolve(
    params: Option<&Value>,
    state: &Arc<WsServerState>,
    conn: &ConnectionContext,
) -> Result<Value, ErrorShape> {
    let id = params
        .and_then(|v| v.get("id"))
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| error_shape(ERROR_INVALID_REQUEST, "id is required", None))?;
    let decision = params
        .and_then(|v| v.get("decision"))
        .and_then(|v| v.as_str())
        .and_then(ExecApprovalDecision::from_str_opt)
        .ok_or_else(|| {
            error_shape(
                ERROR_INVALID_REQUEST,
                "invalid decision (must be allow-once, allow-always, or deny)",
                None,
            )
        })?;

    let resolved = state
        .exec_engine
        .approval_manager()
        .resolve(id, decision, Some(&conn.client_name));
    if !resolved {
        return Err(error_shape(
            ERROR_INVALID_REQUEST,
            "unknown or already resolved approval id",
            Some(json!({ "id": id })),
        ));
    }

    state.broadcast_event(
        "exec.approval.resolved",
        json!({
            "id": id,
            "decision": decision.as_str(),
            "resolvedBy": conn.client_name,
            "ts": now_ms(),
        }),
    );

    Ok(json!({ "ok": true, "id": id, "decision": decision.as_str() }))
}
