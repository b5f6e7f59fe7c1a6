//! Layered tool allow/deny composition.
//!
//! Four layers gate an agent's tools: global, agent, sandbox, subagent.
//! Composition starts from "all tools", and each layer may only restrict:
//! its denies accumulate, and a non-empty allow intersects with whatever is
//! still allowed. A later layer's allow can never re-grant something an
//! earlier layer denied.
//!
//! The policy is enforced twice: once when building the tool definitions
//! sent to the LLM, and again at dispatch time in case the model names a
//! tool it was never shown.

use std::collections::HashSet;

use serde_json::Value;

use crate::agent::provider::ToolDefinition;

/// One layer's allow/deny lists. Empty allow means "no restriction".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolLayer {
    pub allow: Vec<String>,
    pub deny: Vec<String>,
}

impl ToolLayer {
    pub fn new(allow: &[&str], deny: &[&str]) -> Self {
        Self {
            allow: allow.iter().map(|s| s.to_string()).collect(),
            deny: deny.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Parse a `{ "allow": [...], "deny": [...] }` config object.
    pub fn from_config(value: Option<&Value>) -> Self {
        let list = |key: &str| {
            value
                .and_then(|v| v.get(key))
                .and_then(|v| v.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_str().map(|s| s.to_string()))
                        .collect()
                })
                .unwrap_or_default()
        };
        Self {
            allow: list("allow"),
            deny: list("deny"),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.allow.is_empty() && self.deny.is_empty()
    }
}

/// The composed result of all layers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EffectiveToolPolicy {
    denied: HashSet<String>,
    /// `None` = unrestricted; `Some` = only these names survive.
    allowed: Option<HashSet<String>>,
}

impl EffectiveToolPolicy {
    /// Compose layers left to right: global → agent → sandbox → subagent.
    pub fn compose(layers: &[ToolLayer]) -> Self {
        let mut policy = EffectiveToolPolicy::default();
        for layer in layers {
            policy.denied.extend(layer.deny.iter().cloned());
            if !layer.allow.is_empty() {
                let layer_allow: HashSet<String> = layer.allow.iter().cloned().collect();
                policy.allowed = Some(match policy.allowed.take() {
                    Some(current) => current.intersection(&layer_allow).cloned().collect(),
                    None => layer_allow,
                });
            }
        }
        policy
    }

    /// Returns `true` if `tool_name` survives every layer.
    pub fn is_allowed(&self, tool_name: &str) -> bool {
        if self.denied.contains(tool_name) {
            return false;
        }
        match &self.allowed {
            Some(allowed) => allowed.contains(tool_name),
            None => true,
        }
    }

    /// Filter the tool definitions exposed to the LLM.
    pub fn filter_tools(&self, tools: Vec<ToolDefinition>) -> Vec<ToolDefinition> {
        tools
            .into_iter()
            .filter(|t| self.is_allowed(&t.name))
            .collect()
    }
}

/// Resolve the sandbox tools layer for an agent.
///
/// `agent.sandbox.tools` is replaced (not merged) by
/// `routing.agents.<id>.sandbox.tools` when the latter exists.
pub fn sandbox_tools_layer(cfg: &Value, agent_id: &str) -> ToolLayer {
    let routed = cfg
        .get("routing")
        .and_then(|r| r.get("agents"))
        .and_then(|a| a.get(agent_id))
        .and_then(|e| e.get("sandbox"))
        .and_then(|s| s.get("tools"));
    if routed.is_some() {
        return ToolLayer::from_config(routed);
    }
    ToolLayer::from_config(
        cfg.get("agent")
            .and_then(|a| a.get("sandbox"))
            .and_then(|s| s.get("tools")),
    )
}
