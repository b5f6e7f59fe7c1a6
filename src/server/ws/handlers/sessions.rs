//! Session RPCs and chat submission.

use serde_json::{json, Value};
use std::sync::Arc;

use super::{error_shape, ErrorShape};
use crate::agent::runner::InboundMessage;
use crate::agent::AgentError;
use crate::server::ws::{WsServerState, ERROR_INVALID_REQUEST, ERROR_UNAVAILABLE};
use crate::sessions::{ChatType, GroupActivation, QueueDropPolicy, SessionEntry};

fn agent_id(params: Option<&Value>) -> String {
    params
        .and_then(|v| v.get("agentId"))
        .and_then(|v| v.as_str())
        .unwrap_or("main")
        .to_string()
}

fn require_session_key(params: Option<&Value>) -> Result<String, ErrorShape> {
    params
        .and_then(|v| v.get("sessionKey"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| error_shape(ERROR_INVALID_REQUEST, "sessionKey is required", None))
}

fn entry_to_value(key: &str, entry: &SessionEntry) -> Value {
    let mut value = serde_json::to_value(entry).unwrap_or(json!({}));
    if let Some(obj) = value.as_object_mut() {
        obj.insert("sessionKey".to_string(), json!(key));
    }
    value
}

pub(crate) fn handle_session_list(
    params: Option<&Value>,
    state: &WsServerState,
) -> Result<Value, ErrorShape> {
    let agent = agent_id(params);
    let map = state
        .orchestrator
        .session_store()
        .load(&agent)
        .map_err(|e| error_shape(ERROR_UNAVAILABLE, &e.to_string(), None))?;
    let mut sessions: Vec<Value> = map
        .iter()
        .map(|(key, entry)| entry_to_value(key, entry))
        .collect();
    sessions.sort_by(|a, b| {
        b["updatedAt"]
            .as_u64()
            .unwrap_or(0)
            .cmp(&a["updatedAt"].as_u64().unwrap_or(0))
    });
    Ok(json!({ "agentId": agent, "sessions": sessions }))
}

pub(crate) fn handle_session_status(
    params: Option<&Value>,
    state: &WsServerState,
) -> Result<Value, ErrorShape> {
    let agent = agent_id(params);
    let key = require_session_key(params)?;
    let entry = state
        .orchestrator
        .session_store()
        .resolve(&agent, &key)
        .map_err(|e| error_shape(ERROR_UNAVAILABLE, &e.to_string(), None))?;
    Ok(json!({
        "agentId": agent,
        "sessionKey": key,
        "session": entry.map(|e| entry_to_value(&key, &e)),
    }))
}

/// Patch session settings. Model and provider overrides move together:
/// patching `model` to null clears both and drops the auth-profile
/// override.
pub(crate) fn handle_session_patch(
    params: Option<&Value>,
    state: &WsServerState,
) -> Result<Value, ErrorShape> {
    let agent = agent_id(params);
    let key = require_session_key(params)?;
    let patch = params.cloned().unwrap_or(json!({}));

    let updated = state
        .orchestrator
        .session_store()
        .update(&agent, |map| {
            let entry = map
                .entry(key.clone())
                .or_insert_with(|| SessionEntry::new(ChatType::Direct));

            if let Some(model) = patch.get("model") {
                match model.as_str() {
                    Some(model) => {
                        let provider = patch
                            .get("provider")
                            .and_then(|v| v.as_str())
                            .unwrap_or("anthropic");
                        entry.set_model_override(provider, model);
                    }
                    None => entry.clear_model_override(),
                }
            }
            if let Some(profile) = patch.get("authProfile").and_then(|v| v.as_str()) {
                entry.set_auth_profile_override(profile, "patch");
            }
            if let Some(activation) = patch.get("groupActivation").and_then(|v| v.as_str()) {
                entry.group_activation = match activation {
                    "any" => GroupActivation::Any,
                    "off" => GroupActivation::Off,
                    _ => GroupActivation::Mention,
                };
            }
            if let Some(debounce) = patch.get("queueDebounceMs").and_then(|v| v.as_u64()) {
                entry.queue_debounce_ms = Some(debounce);
            }
            if let Some(cap) = patch.get("queueCap").and_then(|v| v.as_u64()) {
                entry.queue_cap = Some(cap as usize);
            }
            if let Some(drop) = patch.get("queueDrop").and_then(|v| v.as_str()) {
                entry.queue_drop = match drop {
                    "newest" => Some(QueueDropPolicy::Newest),
                    "reject" => Some(QueueDropPolicy::Reject),
                    _ => Some(QueueDropPolicy::Oldest),
                };
            }
            entry.touch();
            entry.clone()
        })
        .map_err(|e| error_shape(ERROR_UNAVAILABLE, &e.to_string(), None))?;

    Ok(json!({
        "agentId": agent,
        "sessionKey": key,
        "session": entry_to_value(&key, &updated),
    }))
}

pub(crate) fn handle_session_reset(
    params: Option<&Value>,
    state: &WsServerState,
) -> Result<Value, ErrorShape> {
    let agent = agent_id(params);
    let key = require_session_key(params)?;
    let removed = state
        .orchestrator
        .session_store()
        .reset(&agent, &key)
        .map_err(|e| error_shape(ERROR_UNAVAILABLE, &e.to_string(), None))?;
    Ok(json!({
        "agentId": agent,
        "sessionKey": key,
        "reset": removed.is_some(),
    }))
}

pub(crate) fn handle_chat_send(
    params: Option<&Value>,
    state: &Arc<WsServerState>,
) -> Result<Value, ErrorShape> {
    let agent = agent_id(params);
    let key = require_session_key(params)?;
    let text = params
        .and_then(|v| v.get("text").or_else(|| v.get("message")))
        .and_then(|v| v.as_str())
        .ok_or_else(|| error_shape(ERROR_INVALID_REQUEST, "text is required", None))?;
    let channel = params
        .and_then(|v| v.get("channel"))
        .and_then(|v| v.as_str())
        .unwrap_or("webchat");
    let sender = params
        .and_then(|v| v.get("sender"))
        .and_then(|v| v.as_str())
        .unwrap_or("operator");
    let chat_type = match params
        .and_then(|v| v.get("chatType"))
        .and_then(|v| v.as_str())
    {
        Some("group") => ChatType::Group,
        Some("channel") => ChatType::Channel,
        _ => ChatType::Direct,
    };

    match state.orchestrator.submit(InboundMessage {
        agent_id: agent.clone(),
        session_key: key.clone(),
        channel: channel.to_string(),
        chat_type,
        sender: sender.to_string(),
        text: text.to_string(),
    }) {
        Ok(()) => Ok(json!({ "ok": true, "agentId": agent, "sessionKey": key })),
        Err(AgentError::QueueRejected) => Err(error_shape(
            ERROR_UNAVAILABLE,
            "session queue rejected the message",
            Some(json!({ "sessionKey": key })),
        )),
        Err(err) => Err(error_shape(ERROR_UNAVAILABLE, &err.to_string(), None)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::ws::tests::test_state;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_patch_then_status_and_reset() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        let params = json!({
            "sessionKey": "agent:main:dm:alice",
            "model": "claude-opus-4",
            "provider": "anthropic",
            "queueDrop": "reject",
            "queueCap": 5,
        });
        let patched = handle_session_patch(Some(&params), &state).unwrap();
        assert_eq!(patched["session"]["modelOverride"], "claude-opus-4");
        assert_eq!(patched["session"]["providerOverride"], "anthropic");
        assert_eq!(patched["session"]["queueDrop"], "reject");

        let status = handle_session_status(
            Some(&json!({ "sessionKey": "agent:main:dm:alice" })),
            &state,
        )
        .unwrap();
        assert_eq!(status["session"]["queueCap"], 5);

        let reset = handle_session_reset(
            Some(&json!({ "sessionKey": "agent:main:dm:alice" })),
            &state,
        )
        .unwrap();
        assert_eq!(reset["reset"], true);
        let reset = handle_session_reset(
            Some(&json!({ "sessionKey": "agent:main:dm:alice" })),
            &state,
        )
        .unwrap();
        assert_eq!(reset["reset"], false);
    }

    #[tokio::test]
    async fn test_patch_model_null_clears_pair_and_auth_profile() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        let key = "agent:main:dm:bob";
        handle_session_patch(
            Some(&json!({ "sessionKey": key, "model": "claude-opus-4", "authProfile": "work" })),
            &state,
        )
        .unwrap();

        let cleared = handle_session_patch(
            Some(&json!({ "sessionKey": key, "model": null })),
            &state,
        )
        .unwrap();
        assert!(cleared["session"]["modelOverride"].is_null());
        assert!(cleared["session"]["providerOverride"].is_null());
        assert!(cleared["session"]["authProfileOverride"].is_null());
    }

    #[tokio::test]
    async fn test_session_list_orders_by_recency() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        handle_session_patch(Some(&json!({ "sessionKey": "agent:main:dm:a" })), &state).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        handle_session_patch(Some(&json!({ "sessionKey": "agent:main:dm:b" })), &state).unwrap();

        let list = handle_session_list(None, &state).unwrap();
        let sessions = list["sessions"].as_array().unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0]["sessionKey"], "agent:main:dm:b");
    }

    #[tokio::test]
    async fn test_chat_send_requires_text() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        let err = handle_chat_send(Some(&json!({ "sessionKey": "agent:main:main" })), &state)
            .unwrap_err();
        assert_eq!(err.code, ERROR_INVALID_REQUEST);
    }
}
