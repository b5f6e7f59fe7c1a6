//! Exec approvals: the persisted allowlist store and its policy vocabulary.
//!
//! Every shell command the gateway runs on behalf of an agent passes through
//! this store. The file at `<state>/exec-approvals.json` holds per-agent
//! allowlists plus scalar defaults; the `"*"` agent merges into every agent
//! (allowlist prepended, scalars as fallback). The file is written with 0600
//! permissions and a fresh socket token when first created.

pub mod manager;
pub mod matcher;
pub mod socket;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Schema version for the approvals file.
pub const APPROVALS_FILE_VERSION: u32 = 1;

/// Exec security level. Forms a lattice `deny < allowlist < full`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecSecurity {
    Deny,
    Allowlist,
    Full,
}

impl ExecSecurity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deny => "deny",
            Self::Allowlist => "allowlist",
            Self::Full => "full",
        }
    }
}

/// Compose two security levels; the stricter one wins.
///
/// Commutative and associative with `deny` as the absorbing element.
pub fn min_security(a: ExecSecurity, b: ExecSecurity) -> ExecSecurity {
    a.min(b)
}

/// Ask policy. Forms a lattice `off < on-miss < always`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecAsk {
    Off,
    OnMiss,
    Always,
}

impl ExecAsk {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::OnMiss => "on-miss",
            Self::Always => "always",
        }
    }
}

/// Compose two ask policies; the more demanding one wins.
///
/// Commutative and associative with `always` as the absorbing element.
pub fn max_ask(a: ExecAsk, b: ExecAsk) -> ExecAsk {
    a.max(b)
}

/// What to do when an approval request times out with no responder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AskFallback {
    /// Deny the command.
    Deny,
    /// Defer to the allowlist match.
    Allowlist,
    /// Permit the command.
    Full,
}

/// A decision on an exec approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecApprovalDecision {
    /// Allow the command to execute this one time.
    AllowOnce,
    /// Allow the command and remember it in the allowlist.
    AllowAlways,
    /// Deny the command execution.
    Deny,
}

impl ExecApprovalDecision {
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "allow-once" => Some(Self::AllowOnce),
            "allow-always" => Some(Self::AllowAlways),
            "deny" => Some(Self::Deny),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AllowOnce => "allow-once",
            Self::AllowAlways => "allow-always",
            Self::Deny => "deny",
        }
    }
}

/// One allowlist entry: a glob pattern plus last-use bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalEntry {
    pub pattern: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_resolved_path: Option<String>,
}

impl ApprovalEntry {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            last_used_at: None,
            last_used_command: None,
            last_resolved_path: None,
        }
    }
}

/// Scalar defaults; every field optional so layers can fall through.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalDefaults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<ExecSecurity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ask: Option<ExecAsk>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ask_fallback: Option<AskFallback>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_allow_skills: Option<bool>,
}

impl ApprovalDefaults {
    /// Fill missing fields from `other` (self wins).
    fn or(&self, other: &ApprovalDefaults) -> ApprovalDefaults {
        ApprovalDefaults {
            security: self.security.or(other.security),
            ask: self.ask.or(other.ask),
            ask_fallback: self.ask_fallback.or(other.ask_fallback),
            auto_allow_skills: self.auto_allow_skills.or(other.auto_allow_skills),
        }
    }
}

/// Per-agent section: scalar defaults plus an allowlist.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentApprovals {
    #[serde(flatten)]
    pub defaults: ApprovalDefaults,
    #[serde(default)]
    pub allowlist: Vec<ApprovalEntry>,
}

/// Socket rendezvous shared with out-of-band approval responders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocketInfo {
    pub path: String,
    pub token: String,
}

/// The on-disk approvals file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalsFile {
    pub version: u32,
    pub socket: SocketInfo,
    #[serde(default)]
    pub defaults: ApprovalDefaults,
    #[serde(default)]
    pub agents: HashMap<String, AgentApprovals>,
}

/// Effective approvals for one agent after all layers compose.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedExecApprovals {
    pub security: ExecSecurity,
    pub ask: ExecAsk,
    pub ask_fallback: AskFallback,
    pub auto_allow_skills: bool,
    pub allowlist: Vec<ApprovalEntry>,
}

/// Errors from the approval store.
#[derive(Debug, thiserror::Error)]
pub enum ApprovalStoreError {
    #[error("I/O error on {path}: {message}")]
    Io { path: String, message: String },

    #[error("JSON error on {path}: {message}")]
    Json { path: String, message: String },
}

/// File-backed approval store.
///
/// Readers always reload from disk; the in-memory state is never promoted to
/// source of truth. A per-store mutex serializes read-modify-write cycles.
pub struct ApprovalStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for ApprovalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApprovalStore")
            .field("path", &self.path)
            .finish()
    }
}

impl ApprovalStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    /// Store rooted in the given state directory
    /// (`<state>/exec-approvals.json`).
    pub fn in_state_dir(state_dir: &Path) -> Self {
        Self::new(state_dir.join("exec-approvals.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the approvals file. A missing file yields fresh defaults with a
    /// new socket path and random token, persisted back with 0600.
    pub fn load(&self) -> Result<ApprovalsFile, ApprovalStoreError> {
        if !self.path.exists() {
            let file = self.fresh_file();
            let _guard = self.write_lock.lock();
            self.write_file(&file)?;
            return Ok(file);
        }
        let text = fs::read_to_string(&self.path).map_err(|e| self.io_err(e))?;
        serde_json::from_str(&text).map_err(|e| ApprovalStoreError::Json {
            path: self.path.display().to_string(),
            message: e.to_string(),
        })
    }

    fn fresh_file(&self) -> ApprovalsFile {
        let socket_path = self
            .path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("exec-approvals.sock");
        ApprovalsFile {
            version: APPROVALS_FILE_VERSION,
            socket: SocketInfo {
                path: socket_path.display().to_string(),
                token: generate_socket_token(),
            },
            defaults: ApprovalDefaults::default(),
            agents: HashMap::new(),
        }
    }

    /// Resolve effective approvals for an agent.
    ///
    /// Precedence, most specific first:
    /// `agents[agent_id]` → `agents["*"]` → `file.defaults` → `overrides` →
    /// hardcoded (`security=deny, ask=on-miss, askFallback=deny,
    /// autoAllowSkills=false`). The `"*"` allowlist is prepended to the
    /// agent's own.
    pub fn resolve(
        &self,
        agent_id: &str,
        overrides: &ApprovalDefaults,
    ) -> Result<ResolvedExecApprovals, ApprovalStoreError> {
        let file = self.load()?;
        Ok(resolve_exec_approvals(&file, agent_id, overrides))
    }

    /// Record that an allowlist entry just matched a command.
    pub fn record_allowlist_use(
        &self,
        agent_id: &str,
        pattern: &str,
        command: &str,
        resolved_path: Option<&str>,
    ) -> Result<(), ApprovalStoreError> {
        self.update(|file| {
            let now = now_ms();
            for scope in [agent_id, "*"] {
                if let Some(agent) = file.agents.get_mut(scope) {
                    for entry in agent.allowlist.iter_mut() {
                        if entry.pattern == pattern {
                            entry.last_used_at = Some(now);
                            entry.last_used_command = Some(command.to_string());
                            entry.last_resolved_path = resolved_path.map(|s| s.to_string());
                            return true;
                        }
                    }
                }
            }
            false
        })
        .map(|_| ())
    }

    /// Append a pattern to an agent's allowlist. No-op when the pattern is
    /// already present (in the agent's own list or the `"*"` list).
    pub fn add_allowlist_entry(
        &self,
        agent_id: &str,
        pattern: &str,
    ) -> Result<bool, ApprovalStoreError> {
        self.update(|file| {
            let exists = [agent_id, "*"].iter().any(|scope| {
                file.agents
                    .get(*scope)
                    .map(|a| a.allowlist.iter().any(|e| e.pattern == pattern))
                    .unwrap_or(false)
            });
            if exists {
                return false;
            }
            file.agents
                .entry(agent_id.to_string())
                .or_default()
                .allowlist
                .push(ApprovalEntry::new(pattern));
            true
        })
    }

    /// Atomic read-modify-write under the store lock. The mutator returns
    /// whether anything changed; unchanged files are not rewritten.
    pub fn update<F>(&self, mutator: F) -> Result<bool, ApprovalStoreError>
    where
        F: FnOnce(&mut ApprovalsFile) -> bool,
    {
        let _guard = self.write_lock.lock();
        let mut file = if self.path.exists() {
            let text = fs::read_to_string(&self.path).map_err(|e| self.io_err(e))?;
            serde_json::from_str(&text).map_err(|e| ApprovalStoreError::Json {
                path: self.path.display().to_string(),
                message: e.to_string(),
            })?
        } else {
            self.fresh_file()
        };
        let changed = mutator(&mut file);
        if changed {
            self.write_file(&file)?;
        }
        Ok(changed)
    }

    fn write_file(&self, file: &ApprovalsFile) -> Result<(), ApprovalStoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| self.io_err(e))?;
        }
        let content = serde_json::to_string_pretty(file).map_err(|e| ApprovalStoreError::Json {
            path: self.path.display().to_string(),
            message: e.to_string(),
        })?;
        let temp_path = self.path.with_extension("tmp");
        fs::write(&temp_path, content).map_err(|e| self.io_err(e))?;
        restrict_permissions(&temp_path).map_err(|e| self.io_err(e))?;
        fs::rename(&temp_path, &self.path).map_err(|e| self.io_err(e))?;
        Ok(())
    }

    fn io_err(&self, e: std::io::Error) -> ApprovalStoreError {
        ApprovalStoreError::Io {
            path: self.path.display().to_string(),
            message: e.to_string(),
        }
    }
}

/// Pure resolution over an already-loaded file.
pub fn resolve_exec_approvals(
    file: &ApprovalsFile,
    agent_id: &str,
    overrides: &ApprovalDefaults,
) -> ResolvedExecApprovals {
    let hardcoded = ApprovalDefaults {
        security: Some(ExecSecurity::Deny),
        ask: Some(ExecAsk::OnMiss),
        ask_fallback: Some(AskFallback::Deny),
        auto_allow_skills: Some(false),
    };
    let defaults = file.defaults.or(overrides).or(&hardcoded);

    let wildcard = file.agents.get("*");
    let agent = file.agents.get(agent_id);

    let scalars = agent
        .map(|a| a.defaults.clone())
        .unwrap_or_default()
        .or(&wildcard.map(|a| a.defaults.clone()).unwrap_or_default())
        .or(&defaults);

    let mut allowlist = Vec::new();
    if let Some(wildcard) = wildcard {
        allowlist.extend(wildcard.allowlist.iter().cloned());
    }
    if let Some(agent) = agent {
        allowlist.extend(agent.allowlist.iter().cloned());
    }

    ResolvedExecApprovals {
        security: scalars.security.unwrap_or(ExecSecurity::Deny),
        ask: scalars.ask.unwrap_or(ExecAsk::OnMiss),
        ask_fallback: scalars.ask_fallback.unwrap_or(AskFallback::Deny),
        auto_allow_skills: scalars.auto_allow_skills.unwrap_or(false),
        allowlist,
    }
}

/// 24 random bytes, hex-encoded.
fn generate_socket_token() -> String {
    let mut bytes = [0u8; 24];
    if getrandom::getrandom(&mut bytes).is_err() {
        // Extremely unlikely; fall back to a UUID-derived token.
        return uuid::Uuid::new_v4().simple().to_string();
    }
    hex::encode(bytes)
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}
