//! Exec engine: gated shell execution with streaming output.
//!
//! Every command passes the ordered gate pipeline in [`executor`], then runs
//! on one of three hosts: the agent's sandbox container, the gateway itself,
//! or a remote node. Output accrues on an [`ExecSessionState`] that survives
//! the invoking tool call when the session backgrounds.

pub mod executor;
pub mod registry;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::approvals::{ExecAsk, ExecSecurity};

/// Total output ceiling per exec session, in chars.
pub const MAX_AGGREGATE_CHARS: usize = 200_000;

/// Tail length carried in exit notifications.
pub const NOTIFY_TAIL_CHARS: usize = 400;

/// Default yield window before a foreground exec backgrounds itself.
pub const DEFAULT_YIELD_MS: u64 = 10_000;

/// Yield clamp bounds.
pub const MIN_YIELD_MS: u64 = 10;
pub const MAX_YIELD_MS: u64 = 120_000;

/// Default hard timeout for a command.
pub const DEFAULT_TIMEOUT_SECS: u64 = 1_800;

/// Grace period between the timeout kill and finalizing the result.
pub const TIMEOUT_GRACE_MS: u64 = 1_000;

/// Where a command runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecHost {
    #[default]
    Sandbox,
    Gateway,
    Node,
}

impl ExecHost {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sandbox => "sandbox",
            Self::Gateway => "gateway",
            Self::Node => "node",
        }
    }
}

/// Inputs to one exec invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecParams {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub yield_ms: Option<u64>,
    #[serde(default)]
    pub background: bool,
    /// Hard timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub pty: bool,
    #[serde(default)]
    pub elevated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<ExecHost>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<ExecSecurity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ask: Option<ExecAsk>,
    /// Target node when host=node and several nodes are paired.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    /// Channel the triggering message came from (elevated gate input).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default)]
    pub notify_on_exit: bool,
}

/// Terminal status of an exec result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecStatus {
    Running,
    Completed,
    Failed,
}

/// What `exec` hands back to the tool call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecResult {
    pub status: ExecStatus,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Aggregated output captured so far.
    pub output: String,
    pub truncated: bool,
    pub backgrounded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Denials and failures from the gate pipeline, each naming its gate.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum ExecDenied {
    #[error("elevated-not-available: {0}")]
    ElevatedNotAvailable(String),

    #[error("host-not-allowed: requested {requested} but agent allows {allowed}")]
    HostNotAllowed { requested: String, allowed: String },

    #[error("security=deny: command execution is disabled for this agent")]
    SecurityDeny,

    #[error("allowlist-miss: '{0}' did not match any allowlist entry")]
    AllowlistMiss(String),

    #[error("approval-timeout: no decision within {0} ms")]
    ApprovalTimeout(u64),

    #[error("user-denied: '{0}' was denied by the operator")]
    UserDenied(String),

    #[error("node-not-paired: {0}")]
    NodeNotPaired(String),

    #[error("command-timed-out after {timeout_secs} s{tail}")]
    CommandTimedOut { timeout_secs: u64, tail: String },

    #[error("command-exited-non-zero ({code}){tail}")]
    CommandExitedNonZero { code: i32, tail: String },

    #[error("spawn failed: {0}")]
    Spawn(String),
}

/// Source of a kill request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelSource {
    /// Tool-call signal: only kills sessions that have not backgrounded.
    Signal,
    /// Timeout: always kills.
    Timeout,
    /// Explicit operator kill via the process tool: always kills.
    Operator,
}

/// Runtime record of a spawned command.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecSessionState {
    /// Short slug id.
    pub id: String,
    pub command: String,
    /// Container scope the command ran in (empty for host runs).
    pub scope_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub started_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    /// Sliding window of the latest output.
    pub tail: String,
    /// Full output up to [`MAX_AGGREGATE_CHARS`].
    pub aggregated: String,
    pub total_output_chars: usize,
    /// Output since the last poll, split by stream.
    pub pending_stdout: String,
    pub pending_stderr: String,
    pub truncated: bool,
    pub exited: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_signal: Option<String>,
    pub backgrounded: bool,
    pub notify_on_exit: bool,
    pub exit_notified: bool,
}

impl ExecSessionState {
    pub fn new(command: &str, scope_key: &str, session_key: Option<&str>) -> Self {
        Self {
            id: new_session_slug(),
            command: command.to_string(),
            scope_key: scope_key.to_string(),
            session_key: session_key.map(|s| s.to_string()),
            pid: None,
            started_at: now_ms(),
            cwd: None,
            tail: String::new(),
            aggregated: String::new(),
            total_output_chars: 0,
            pending_stdout: String::new(),
            pending_stderr: String::new(),
            truncated: false,
            exited: false,
            exit_code: None,
            exit_signal: None,
            backgrounded: false,
            notify_on_exit: false,
            exit_notified: false,
        }
    }

    /// Append one output chunk, maintaining aggregate, tail, and cap.
    pub fn append_output(&mut self, chunk: &str, stderr: bool) {
        self.total_output_chars += chunk.chars().count();
        if stderr {
            self.pending_stderr.push_str(chunk);
        } else {
            self.pending_stdout.push_str(chunk);
        }

        let remaining = MAX_AGGREGATE_CHARS.saturating_sub(self.aggregated.chars().count());
        if remaining > 0 {
            self.aggregated.extend(chunk.chars().take(remaining));
        }
        if self.total_output_chars > MAX_AGGREGATE_CHARS {
            self.truncated = true;
        }

        self.tail.push_str(chunk);
        let tail_len = self.tail.chars().count();
        if tail_len > MAX_AGGREGATE_CHARS {
            let excess = tail_len - MAX_AGGREGATE_CHARS;
            self.tail = self.tail.chars().skip(excess).collect();
        }
    }

    /// Drain the per-stream pending buffers (process-tool poll).
    pub fn take_pending(&mut self) -> (String, String) {
        (
            std::mem::take(&mut self.pending_stdout),
            std::mem::take(&mut self.pending_stderr),
        )
    }

    /// Tail normalized for a one-line notification.
    pub fn notify_tail(&self) -> String {
        let flattened: String = self
            .tail
            .chars()
            .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
            .collect();
        let trimmed = flattened.split_whitespace().collect::<Vec<_>>().join(" ");
        if trimmed.chars().count() > NOTIFY_TAIL_CHARS {
            trimmed
                .chars()
                .skip(trimmed.chars().count() - NOTIFY_TAIL_CHARS)
                .collect()
        } else {
            trimmed
        }
    }

    /// First eight characters of the session id, for notifications.
    pub fn short_id(&self) -> String {
        self.id.chars().take(8).collect()
    }
}

/// Exit note queued toward the session heartbeat when a backgrounded exec
/// finishes.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecExitNote {
    pub session_key: String,
    pub text: String,
}

/// Build the system-event line for an exited session.
pub fn format_exit_note(state: &ExecSessionState) -> String {
    let status = if state.exit_code == Some(0) {
        "completed"
    } else {
        "failed"
    };
    let code = match (&state.exit_signal, state.exit_code) {
        (Some(signal), _) => signal.clone(),
        (None, Some(code)) => code.to_string(),
        (None, None) => "?".to_string(),
    };
    format!(
        "Exec {status} ({}, {code}) :: {}",
        state.short_id(),
        state.notify_tail()
    )
}

fn new_session_slug() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

/// Clamp a requested yield window into the permitted band.
pub fn clamp_yield_ms(requested: Option<u64>) -> u64 {
    requested
        .unwrap_or(DEFAULT_YIELD_MS)
        .clamp(MIN_YIELD_MS, MAX_YIELD_MS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_output_tracks_pending_streams() {
        let mut state = ExecSessionState::new("echo hi", "", None);
        state.append_output("out1", false);
        state.append_output("err1", true);
        assert_eq!(state.pending_stdout, "out1");
        assert_eq!(state.pending_stderr, "err1");
        assert_eq!(state.aggregated, "out1err1");
        assert_eq!(state.total_output_chars, 8);

        let (out, err) = state.take_pending();
        assert_eq!(out, "out1");
        assert_eq!(err, "err1");
        assert!(state.pending_stdout.is_empty());
    }

    #[test]
    fn test_output_cap_sets_truncated() {
        let mut state = ExecSessionState::new("yes", "", None);
        let chunk = "x".repeat(MAX_AGGREGATE_CHARS / 2 + 1);
        state.append_output(&chunk, false);
        assert!(!state.truncated);
        state.append_output(&chunk, false);
        assert!(state.truncated);
        assert_eq!(state.aggregated.chars().count(), MAX_AGGREGATE_CHARS);
    }

    #[test]
    fn test_notify_tail_normalizes_and_caps() {
        let mut state = ExecSessionState::new("make", "", None);
        state.append_output("line one\nline\ttwo\r\nline   three\n", false);
        assert_eq!(state.notify_tail(), "line one line two line three");

        let mut long = ExecSessionState::new("yes", "", None);
        long.append_output(&"y\n".repeat(NOTIFY_TAIL_CHARS * 2), false);
        assert!(long.notify_tail().chars().count() <= NOTIFY_TAIL_CHARS);
    }

    #[test]
    fn test_format_exit_note() {
        let mut state = ExecSessionState::new("make", "", Some("agent:main:main"));
        state.append_output("done\n", false);
        state.exited = true;
        state.exit_code = Some(0);
        let note = format_exit_note(&state);
        assert!(note.starts_with(&format!("Exec completed ({}, 0) :: ", state.short_id())));
        assert!(note.ends_with(":: done"));

        state.exit_code = Some(2);
        assert!(format_exit_note(&state).starts_with("Exec failed"));

        state.exit_signal = Some("SIGKILL".to_string());
        assert!(format_exit_note(&state).contains("SIGKILL"));
    }

    #[test]
    fn test_clamp_yield_ms() {
        assert_eq!(clamp_yield_ms(None), DEFAULT_YIELD_MS);
        assert_eq!(clamp_yield_ms(Some(1)), MIN_YIELD_MS);
        assert_eq!(clamp_yield_ms(Some(10_000_000)), MAX_YIELD_MS);
        assert_eq!(clamp_yield_ms(Some(500)), 500);
    }

    #[test]
    fn test_denied_messages_name_their_gate() {
        assert!(ExecDenied::SecurityDeny.to_string().starts_with("security=deny"));
        assert!(ExecDenied::AllowlistMiss("rg".into())
            .to_string()
            .starts_with("allowlist-miss"));
        assert!(ExecDenied::ApprovalTimeout(1000)
            .to_string()
            .starts_with("approval-timeout"));
        assert!(ExecDenied::UserDenied("rm".into())
            .to_string()
            .starts_with("user-denied"));
        assert!(ExecDenied::NodeNotPaired("no nodes".into())
            .to_string()
            .starts_with("node-not-paired"));
        assert!(ExecDenied::CommandTimedOut {
            timeout_secs: 5,
            tail: String::new()
        }
        .to_string()
        .starts_with("command-timed-out"));
    }
}
