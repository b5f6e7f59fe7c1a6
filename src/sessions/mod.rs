//! Session entities and key conventions.
//!
//! A session is one conversation thread within an agent, keyed
//! `agent:<agentId>:<surface>:<peer>` (e.g. `agent:main:dm:+15551234`).
//! Sessions are created lazily on the first inbound message and destroyed
//! only by explicit reset.

pub mod queue;
pub mod store;

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Kind of conversation behind a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatType {
    #[default]
    Direct,
    Group,
    Channel,
}

/// When the agent speaks up in a group conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupActivation {
    #[default]
    Mention,
    Any,
    Off,
}

/// What happens to new messages when the queue is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueDropPolicy {
    #[default]
    Oldest,
    Newest,
    Reject,
}

/// Persisted per-session state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEntry {
    pub session_id: String,
    #[serde(default)]
    pub chat_type: ChatType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_override: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_override: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_profile_override: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_profile_override_source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_profile_override_compactions: Option<u32>,
    #[serde(default)]
    pub group_activation: GroupActivation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_debounce_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_cap: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_drop: Option<QueueDropPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_channel: Option<String>,
    pub updated_at: u64,
}

impl SessionEntry {
    /// Fresh session with a random id.
    pub fn new(chat_type: ChatType) -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            chat_type,
            provider_override: None,
            model_override: None,
            auth_profile_override: None,
            auth_profile_override_source: None,
            auth_profile_override_compactions: None,
            group_activation: GroupActivation::default(),
            queue_debounce_ms: None,
            queue_cap: None,
            queue_drop: None,
            last_channel: None,
            updated_at: now_ms(),
        }
    }

    /// Set the model override. Provider and model are set together.
    pub fn set_model_override(&mut self, provider: impl Into<String>, model: impl Into<String>) {
        self.provider_override = Some(provider.into());
        self.model_override = Some(model.into());
        self.touch();
    }

    /// Clear the model override. Provider and model are cleared together and
    /// resetting the model always clears the auth-profile override.
    pub fn clear_model_override(&mut self) {
        self.provider_override = None;
        self.model_override = None;
        self.auth_profile_override = None;
        self.auth_profile_override_source = None;
        self.auth_profile_override_compactions = None;
        self.touch();
    }

    pub fn set_auth_profile_override(&mut self, profile: impl Into<String>, source: impl Into<String>) {
        self.auth_profile_override = Some(profile.into());
        self.auth_profile_override_source = Some(source.into());
        self.auth_profile_override_compactions = Some(0);
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = now_ms();
    }
}

/// Build a session key from its parts.
pub fn build_session_key(agent_id: &str, surface: &str, peer: &str) -> String {
    format!("agent:{agent_id}:{surface}:{peer}")
}

/// The canonical main-session key for an agent.
pub fn build_agent_main_session_key(agent_id: &str) -> String {
    format!("agent:{agent_id}:main")
}

/// Legacy surface aliasing: `dm` and `direct` name the same surface.
pub fn alias_session_key(key: &str) -> Option<String> {
    if let Some(rest) = key.strip_prefix("dm:") {
        return Some(format!("direct:{rest}"));
    }
    if let Some(rest) = key.strip_prefix("direct:") {
        return Some(format!("dm:{rest}"));
    }
    None
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_override_set_and_cleared_together() {
        let mut entry = SessionEntry::new(ChatType::Direct);
        entry.set_model_override("anthropic", "claude-opus-4");
        assert_eq!(entry.provider_override.as_deref(), Some("anthropic"));
        assert_eq!(entry.model_override.as_deref(), Some("claude-opus-4"));

        entry.clear_model_override();
        assert!(entry.provider_override.is_none());
        assert!(entry.model_override.is_none());
    }

    #[test]
    fn test_model_reset_clears_auth_profile_override() {
        let mut entry = SessionEntry::new(ChatType::Direct);
        entry.set_model_override("anthropic", "claude-opus-4");
        entry.set_auth_profile_override("work", "directive");
        assert!(entry.auth_profile_override.is_some());

        entry.clear_model_override();
        assert!(entry.auth_profile_override.is_none());
        assert!(entry.auth_profile_override_source.is_none());
        assert!(entry.auth_profile_override_compactions.is_none());
    }

    #[test]
    fn test_session_key_builders() {
        assert_eq!(
            build_session_key("main", "dm", "+15551234"),
            "agent:main:dm:+15551234"
        );
        assert_eq!(build_agent_main_session_key("main"), "agent:main:main");
    }

    #[test]
    fn test_alias_session_key() {
        assert_eq!(
            alias_session_key("dm:+15551234").as_deref(),
            Some("direct:+15551234")
        );
        assert_eq!(
            alias_session_key("direct:+15551234").as_deref(),
            Some("dm:+15551234")
        );
        assert_eq!(alias_session_key("group:room"), None);
    }

    #[test]
    fn test_serde_round_trip() {
        let mut entry = SessionEntry::new(ChatType::Group);
        entry.queue_debounce_ms = Some(250);
        entry.queue_drop = Some(QueueDropPolicy::Reject);
        let json = serde_json::to_string(&entry).unwrap();
        let back: SessionEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(entry, back);
        assert!(json.contains("\"chatType\":\"group\""));
        assert!(json.contains("\"queueDrop\":\"reject\""));
    }
}
