//! Agent configuration and the agent-side error taxonomy.
//!
//! An agent is a configured worker: a workspace root, a model, a tool
//! policy, a sandbox policy, and exec defaults. Config lives under
//! `agents.defaults` plus per-agent entries in `agents.list` (matched by
//! `id`), with per-agent values taking precedence.

pub mod provider;
pub mod runner;
pub mod tool_policy;

use serde_json::Value;
use std::path::PathBuf;

use crate::approvals::{ApprovalDefaults, AskFallback, ExecAsk, ExecSecurity};
use crate::exec::ExecHost;

/// Agent-side errors.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("provider error: {0}")]
    Provider(String),

    #[error("tool '{0}' denied by policy")]
    ToolDenied(String),

    #[error("queue rejected the message")]
    QueueRejected,

    #[error("no LLM provider configured")]
    NoProvider,

    #[error("turn aborted")]
    Aborted,
}

/// Which sessions run inside the sandbox container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SandboxMode {
    Off,
    /// Sandbox every agent except `main`.
    #[default]
    NonMain,
    All,
}

impl SandboxMode {
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "off" => Some(Self::Off),
            "non-main" => Some(Self::NonMain),
            "all" => Some(Self::All),
            _ => None,
        }
    }
}

/// How sandbox containers are shared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SandboxScope {
    Session,
    #[default]
    Agent,
    Shared,
}

impl SandboxScope {
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "session" => Some(Self::Session),
            "agent" => Some(Self::Agent),
            "shared" => Some(Self::Shared),
            _ => None,
        }
    }
}

/// Whether the container can see the agent workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkspaceAccess {
    None,
    Ro,
    #[default]
    Rw,
}

impl WorkspaceAccess {
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Self::None),
            "ro" => Some(Self::Ro),
            "rw" => Some(Self::Rw),
            _ => None,
        }
    }
}

/// Sandbox policy for one agent.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxConfig {
    pub mode: SandboxMode,
    pub scope: SandboxScope,
    pub workspace_access: WorkspaceAccess,
    pub image: String,
    pub browser_enabled: bool,
    /// Days of inactivity before an idle container is pruned.
    pub prune_days: Option<u32>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            mode: SandboxMode::default(),
            scope: SandboxScope::default(),
            workspace_access: WorkspaceAccess::default(),
            image: "clawdbot-sandbox:latest".to_string(),
            browser_enabled: false,
            prune_days: None,
        }
    }
}

impl SandboxConfig {
    fn from_value(value: Option<&Value>, base: SandboxConfig) -> Self {
        let Some(obj) = value.and_then(|v| v.as_object()) else {
            return base;
        };
        let str_field = |key: &str| obj.get(key).and_then(|v| v.as_str());
        Self {
            mode: str_field("mode")
                .and_then(SandboxMode::from_str_opt)
                .unwrap_or(base.mode),
            scope: str_field("scope")
                .and_then(SandboxScope::from_str_opt)
                .unwrap_or(base.scope),
            workspace_access: str_field("workspaceAccess")
                .and_then(WorkspaceAccess::from_str_opt)
                .unwrap_or(base.workspace_access),
            image: str_field("image").map(|s| s.to_string()).unwrap_or(base.image),
            browser_enabled: obj
                .get("browser")
                .and_then(|v| v.as_bool())
                .unwrap_or(base.browser_enabled),
            prune_days: obj
                .get("pruneDays")
                .and_then(|v| v.as_u64())
                .map(|d| d as u32)
                .or(base.prune_days),
        }
    }

    /// Whether this agent's commands run sandboxed.
    pub fn applies_to(&self, agent_id: &str) -> bool {
        match self.mode {
            SandboxMode::Off => false,
            SandboxMode::NonMain => agent_id != "main",
            SandboxMode::All => true,
        }
    }
}

/// Exec defaults configured per agent.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentExecDefaults {
    pub host: ExecHost,
    pub security: ExecSecurity,
    pub ask: ExecAsk,
    pub ask_fallback: AskFallback,
    pub path_prepend: Vec<String>,
    pub elevated_enabled: bool,
    /// Channels allowed to request elevated runs; empty means any.
    pub elevated_channels: Vec<String>,
}

impl Default for AgentExecDefaults {
    fn default() -> Self {
        Self {
            host: ExecHost::Sandbox,
            security: ExecSecurity::Deny,
            ask: ExecAsk::OnMiss,
            ask_fallback: AskFallback::Deny,
            path_prepend: Vec::new(),
            elevated_enabled: false,
            elevated_channels: Vec::new(),
        }
    }
}

impl AgentExecDefaults {
    fn from_value(value: Option<&Value>, base: AgentExecDefaults) -> Self {
        let Some(obj) = value.and_then(|v| v.as_object()) else {
            return base;
        };
        let parse = |key: &str| obj.get(key).cloned();
        Self {
            host: parse("host")
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or(base.host),
            security: parse("security")
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or(base.security),
            ask: parse("ask")
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or(base.ask),
            ask_fallback: parse("askFallback")
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or(base.ask_fallback),
            path_prepend: obj
                .get("pathPrepend")
                .and_then(|v| v.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_str().map(|s| s.to_string()))
                        .collect()
                })
                .unwrap_or(base.path_prepend),
            elevated_enabled: obj
                .get("elevated")
                .and_then(|e| e.get("enabled"))
                .and_then(|v| v.as_bool())
                .unwrap_or(base.elevated_enabled),
            elevated_channels: obj
                .get("elevated")
                .and_then(|e| e.get("channels"))
                .and_then(|v| v.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_str().map(|s| s.to_string()))
                        .collect()
                })
                .unwrap_or(base.elevated_channels),
        }
    }

    /// Overrides handed to the approval store resolution.
    pub fn approval_overrides(&self) -> ApprovalDefaults {
        ApprovalDefaults {
            security: Some(self.security),
            ask: Some(self.ask),
            ask_fallback: Some(self.ask_fallback),
            auto_allow_skills: None,
        }
    }
}

/// Static configuration of one agent.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    pub id: String,
    pub workspace: PathBuf,
    pub sandbox: SandboxConfig,
    pub exec: AgentExecDefaults,
    pub tools_allow: Vec<String>,
    pub tools_deny: Vec<String>,
    pub model: Option<String>,
    pub provider: Option<String>,
}

impl AgentConfig {
    /// Resolve an agent from config: `agents.defaults` overlaid with the
    /// matching `agents.list` entry.
    pub fn from_config(cfg: &Value, agent_id: &str) -> Self {
        let agents = cfg.get("agents");
        let defaults = agents.and_then(|a| a.get("defaults"));
        let entry = agents
            .and_then(|a| a.get("list"))
            .and_then(|l| l.as_array())
            .and_then(|arr| {
                arr.iter()
                    .find(|e| e.get("id").and_then(|v| v.as_str()) == Some(agent_id))
            });

        let workspace = entry
            .and_then(|e| e.get("workspace"))
            .or_else(|| defaults.and_then(|d| d.get("workspace")))
            .and_then(|v| v.as_str())
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                crate::config::state_dir().join("workspaces").join(agent_id)
            });

        let sandbox = SandboxConfig::from_value(
            entry.and_then(|e| e.get("sandbox")),
            SandboxConfig::from_value(
                defaults.and_then(|d| d.get("sandbox")),
                SandboxConfig::default(),
            ),
        );

        let exec = AgentExecDefaults::from_value(
            entry.and_then(|e| e.get("exec")),
            AgentExecDefaults::from_value(
                defaults.and_then(|d| d.get("exec")),
                AgentExecDefaults::default(),
            ),
        );

        let string_list = |value: Option<&Value>| -> Vec<String> {
            value
                .and_then(|v| v.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_str().map(|s| s.to_string()))
                        .collect()
                })
                .unwrap_or_default()
        };
        let tools = entry
            .and_then(|e| e.get("tools"))
            .or_else(|| defaults.and_then(|d| d.get("tools")));
        let tools_allow = string_list(tools.and_then(|t| t.get("allow")));
        let tools_deny = string_list(tools.and_then(|t| t.get("deny")));

        let model = entry
            .and_then(|e| e.get("model"))
            .or_else(|| defaults.and_then(|d| d.get("model")))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        let provider = entry
            .and_then(|e| e.get("provider"))
            .or_else(|| defaults.and_then(|d| d.get("provider")))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        Self {
            id: agent_id.to_string(),
            workspace,
            sandbox,
            exec,
            tools_allow,
            tools_deny,
            model,
            provider,
        }
    }

    /// Container name for this agent's sandbox per the configured scope.
    pub fn sandbox_container(&self, session_key: Option<&str>) -> String {
        match self.sandbox.scope {
            SandboxScope::Shared => "clawdbot-shared".to_string(),
            SandboxScope::Agent => format!("clawdbot-{}", self.id),
            SandboxScope::Session => {
                let suffix = session_key
                    .map(session_slug)
                    .unwrap_or_else(|| "default".to_string());
                format!("clawdbot-{}-{}", self.id, suffix)
            }
        }
    }
}

/// Filesystem-safe slug of a session key.
fn session_slug(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults_when_config_empty() {
        let cfg = json!({});
        let agent = AgentConfig::from_config(&cfg, "main");
        assert_eq!(agent.id, "main");
        assert_eq!(agent.sandbox.mode, SandboxMode::NonMain);
        assert_eq!(agent.exec.security, ExecSecurity::Deny);
        assert_eq!(agent.exec.ask, ExecAsk::OnMiss);
        assert!(agent.tools_allow.is_empty());
    }

    #[test]
    fn test_agent_entry_overrides_defaults() {
        let cfg = json!({
            "agents": {
                "defaults": {
                    "sandbox": { "mode": "all", "image": "base:1" },
                    "exec": { "security": "allowlist", "host": "gateway" }
                },
                "list": [
                    {
                        "id": "research",
                        "workspace": "/srv/research",
                        "sandbox": { "scope": "session" },
                        "exec": { "ask": "always" },
                        "tools": { "allow": ["exec", "browser"], "deny": ["memory"] }
                    }
                ]
            }
        });
        let agent = AgentConfig::from_config(&cfg, "research");
        assert_eq!(agent.workspace, PathBuf::from("/srv/research"));
        // Inherited from defaults:
        assert_eq!(agent.sandbox.mode, SandboxMode::All);
        assert_eq!(agent.sandbox.image, "base:1");
        assert_eq!(agent.exec.security, ExecSecurity::Allowlist);
        assert_eq!(agent.exec.host, ExecHost::Gateway);
        // Overridden per agent:
        assert_eq!(agent.sandbox.scope, SandboxScope::Session);
        assert_eq!(agent.exec.ask, ExecAsk::Always);
        assert_eq!(agent.tools_allow, vec!["exec", "browser"]);
        assert_eq!(agent.tools_deny, vec!["memory"]);
    }

    #[test]
    fn test_sandbox_mode_applies_to() {
        let mut sandbox = SandboxConfig::default();
        sandbox.mode = SandboxMode::NonMain;
        assert!(!sandbox.applies_to("main"));
        assert!(sandbox.applies_to("research"));

        sandbox.mode = SandboxMode::Off;
        assert!(!sandbox.applies_to("research"));

        sandbox.mode = SandboxMode::All;
        assert!(sandbox.applies_to("main"));
    }

    #[test]
    fn test_container_name_per_scope() {
        let cfg = json!({});
        let mut agent = AgentConfig::from_config(&cfg, "main");

        agent.sandbox.scope = SandboxScope::Agent;
        assert_eq!(agent.sandbox_container(None), "clawdbot-main");

        agent.sandbox.scope = SandboxScope::Shared;
        assert_eq!(agent.sandbox_container(None), "clawdbot-shared");

        agent.sandbox.scope = SandboxScope::Session;
        let name = agent.sandbox_container(Some("agent:main:dm:+1555"));
        assert!(name.starts_with("clawdbot-main-"));
        assert!(!name.contains(':'));
    }

    #[test]
    fn test_elevated_config() {
        let cfg = json!({
            "agents": {
                "list": [{
                    "id": "ops",
                    "exec": { "elevated": { "enabled": true, "channels": ["telegram"] } }
                }]
            }
        });
        let agent = AgentConfig::from_config(&cfg, "ops");
        assert!(agent.exec.elevated_enabled);
        assert_eq!(agent.exec.elevated_channels, vec!["telegram"]);
    }
}
