//! The exec gate pipeline and process lifecycle.
//!
//! Gates run in a fixed order, each returning a precise denial when it
//! fails: elevation, host allowlist, security compose, ask compose, workdir
//! resolution, environment assembly, then host-specific dispatch (node
//! forwarding, or executable resolution + allowlist/ask for the gateway
//! host) and finally the spawn. Runtime failures (non-zero exit, timeout)
//! come back as `failed` results carrying the captured output; gate denials
//! come back as errors.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, watch, OnceCell};
use tracing::{debug, warn};

use crate::agent::AgentConfig;
use crate::approvals::manager::{ApprovalManager, ApprovalRecord, ApprovalRequest};
use crate::approvals::matcher::{match_allowlist, ExecResolution};
use crate::approvals::{
    socket, ApprovalStore, AskFallback, ExecApprovalDecision, ExecAsk, ExecSecurity, max_ask,
    min_security,
};

use super::registry::{ExecSessionHandle, ExecSessionRegistry};
use super::{
    clamp_yield_ms, format_exit_note, CancelSource, ExecDenied, ExecExitNote, ExecHost,
    ExecParams, ExecResult, ExecSessionState, ExecStatus, DEFAULT_TIMEOUT_SECS, TIMEOUT_GRACE_MS,
};

/// Default wait for an approval decision.
const DEFAULT_APPROVAL_TIMEOUT_MS: u64 = 120_000;

/// Callback fired on every output chunk with a fresh session snapshot.
pub type UpdateCallback = Arc<dyn Fn(ExecSessionState) + Send + Sync>;

/// Callback the hub installs to broadcast `exec.approval.requested`.
pub type ApprovalBroadcast = Arc<dyn Fn(ApprovalRecord) + Send + Sync>;

/// A node able to run `system.run` commands for the exec engine.
#[derive(Debug, Clone)]
pub struct NodeHostInfo {
    pub node_id: String,
    pub platform: Option<String>,
    pub commands: Vec<String>,
}

/// Output of a remote `system.run`.
#[derive(Debug, Clone)]
pub struct NodeRunOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Bridge into the node invoke router, kept as a trait so the exec engine
/// does not depend on the hub.
#[async_trait::async_trait]
pub trait NodeCommandHost: Send + Sync {
    fn list_nodes(&self) -> Vec<NodeHostInfo>;
    async fn run_command(
        &self,
        node_id: &str,
        argv: Vec<String>,
        timeout_ms: u64,
    ) -> Result<NodeRunOutput, String>;
}

/// The exec engine: owns the session registry and the approval plumbing.
pub struct ExecEngine {
    registry: Arc<ExecSessionRegistry>,
    approvals: Arc<ApprovalStore>,
    manager: Arc<ApprovalManager>,
    nodes: parking_lot::RwLock<Option<Arc<dyn NodeCommandHost>>>,
    exit_notes: Option<mpsc::UnboundedSender<ExecExitNote>>,
    approval_broadcast: parking_lot::RwLock<Option<ApprovalBroadcast>>,
}

impl std::fmt::Debug for ExecEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecEngine")
            .field("registry", &self.registry)
            .field("approvals", &self.approvals)
            .finish_non_exhaustive()
    }
}

impl ExecEngine {
    pub fn new(approvals: Arc<ApprovalStore>, manager: Arc<ApprovalManager>) -> Self {
        Self {
            registry: Arc::new(ExecSessionRegistry::new()),
            approvals,
            manager,
            nodes: parking_lot::RwLock::new(None),
            exit_notes: None,
            approval_broadcast: parking_lot::RwLock::new(None),
        }
    }

    pub fn with_nodes(self, nodes: Arc<dyn NodeCommandHost>) -> Self {
        *self.nodes.write() = Some(nodes);
        self
    }

    pub fn with_exit_notes(mut self, tx: mpsc::UnboundedSender<ExecExitNote>) -> Self {
        self.exit_notes = Some(tx);
        self
    }

    /// Install the node bridge after construction (the hub does this).
    pub fn set_node_host(&self, nodes: Arc<dyn NodeCommandHost>) {
        *self.nodes.write() = Some(nodes);
    }

    /// Install the `exec.approval.requested` broadcast hook.
    pub fn set_approval_broadcast(&self, broadcast: ApprovalBroadcast) {
        *self.approval_broadcast.write() = Some(broadcast);
    }

    pub fn registry(&self) -> &Arc<ExecSessionRegistry> {
        &self.registry
    }

    pub fn approval_manager(&self) -> &Arc<ApprovalManager> {
        &self.manager
    }

    /// Run one command through the full gate pipeline.
    pub async fn exec(
        &self,
        agent: &AgentConfig,
        params: ExecParams,
        on_update: Option<UpdateCallback>,
    ) -> Result<ExecResult, ExecDenied> {
        // Gate 1: elevation.
        if params.elevated {
            if !agent.exec.elevated_enabled {
                return Err(ExecDenied::ElevatedNotAvailable(format!(
                    "elevated exec is disabled for agent '{}'",
                    agent.id
                )));
            }
            if !agent.exec.elevated_channels.is_empty() {
                let allowed = params
                    .channel
                    .as_deref()
                    .map(|c| agent.exec.elevated_channels.iter().any(|a| a == c))
                    .unwrap_or(false);
                if !allowed {
                    return Err(ExecDenied::ElevatedNotAvailable(format!(
                        "channel '{}' is not allow-listed for elevated exec",
                        params.channel.as_deref().unwrap_or("<none>")
                    )));
                }
            }
        }

        // Gate 2: host allowlist. Elevated runs are forced onto the gateway.
        let configured_host = if agent.exec.host == ExecHost::Sandbox
            && !agent.sandbox.applies_to(&agent.id)
        {
            ExecHost::Gateway
        } else {
            agent.exec.host
        };
        let host = if params.elevated {
            ExecHost::Gateway
        } else {
            let requested = params.host.unwrap_or(configured_host);
            if requested != configured_host {
                return Err(ExecDenied::HostNotAllowed {
                    requested: requested.as_str().to_string(),
                    allowed: configured_host.as_str().to_string(),
                });
            }
            requested
        };

        // Gates 3 + 4: compose security and ask against the approvals file.
        let resolved = self
            .approvals
            .resolve(&agent.id, &agent.exec.approval_overrides())
            .map_err(|e| ExecDenied::Spawn(format!("approvals unavailable: {e}")))?;
        let security = if params.elevated {
            ExecSecurity::Full
        } else {
            params
                .security
                .map(|s| min_security(resolved.security, s))
                .unwrap_or(resolved.security)
        };
        let ask = params
            .ask
            .map(|a| max_ask(resolved.ask, a))
            .unwrap_or(resolved.ask);
        if security == ExecSecurity::Deny {
            return Err(ExecDenied::SecurityDeny);
        }

        // Gate 5: workdir resolution.
        let (host_cwd, container_cwd) = resolve_workdir(agent, params.workdir.as_deref(), host);

        // Gate 6: environment.
        let env = build_env(agent, &params, host).await;

        // Gate 7: node host forwards and returns.
        if host == ExecHost::Node {
            return self.run_on_node(agent, &params).await;
        }

        // Gate 8: gateway-host executable resolution + allowlist/ask.
        // The sandbox container is its own boundary; only host runs consult
        // the allowlist.
        if host == ExecHost::Gateway {
            let path_env = env.get("PATH").cloned().unwrap_or_default();
            let resolution = resolve_executable(&params.command, &host_cwd, &path_env);
            self.authorize(agent, &params, &resolved.allowlist, resolved.ask_fallback, security, ask, params.elevated, &resolution)
                .await?;
        }

        // Gate 9: spawn.
        let scope_key = if host == ExecHost::Sandbox {
            agent.sandbox_container(params.session_key.as_deref())
        } else {
            String::new()
        };
        let mut state = ExecSessionState::new(&params.command, &scope_key, params.session_key.as_deref());
        state.cwd = Some(host_cwd.display().to_string());
        state.notify_on_exit = params.notify_on_exit;
        let state = Arc::new(Mutex::new(state));

        let timeout_secs = params.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS);
        let (kill_tx, kill_rx) = mpsc::unbounded_channel();
        let (done_tx, mut done_rx) = watch::channel(false);
        let handle = ExecSessionHandle::new(Arc::clone(&state), kill_tx);
        self.registry.insert(handle.clone());

        if params.pty && host != ExecHost::Sandbox {
            self.spawn_pty_lifecycle(
                agent,
                &params,
                &host_cwd,
                &env,
                Arc::clone(&state),
                kill_rx,
                done_tx,
                on_update.clone(),
                timeout_secs,
            )?;
        } else {
            let command = build_host_command(agent, &params, host, &host_cwd, container_cwd.as_deref(), &env);
            self.spawn_child_lifecycle(
                command,
                Arc::clone(&state),
                kill_rx,
                done_tx,
                on_update.clone(),
                timeout_secs,
            )?;
        }

        // Gate 10: yield policy.
        if params.background {
            let snapshot = {
                let mut s = state.lock();
                s.backgrounded = true;
                s.clone()
            };
            return Ok(running_result(&snapshot));
        }

        let yield_ms = clamp_yield_ms(params.yield_ms);
        tokio::select! {
            _ = done_rx.changed() => {
                let snapshot = state.lock().clone();
                Ok(finished_result(&snapshot, timeout_secs))
            }
            _ = tokio::time::sleep(Duration::from_millis(yield_ms)) => {
                let snapshot = {
                    let mut s = state.lock();
                    s.backgrounded = true;
                    s.clone()
                };
                Ok(running_result(&snapshot))
            }
        }
    }

    /// Allowlist + ask flow for gateway-host commands.
    #[allow(clippy::too_many_arguments)]
    async fn authorize(
        &self,
        agent: &AgentConfig,
        params: &ExecParams,
        allowlist: &[crate::approvals::ApprovalEntry],
        ask_fallback: AskFallback,
        security: ExecSecurity,
        ask: ExecAsk,
        elevated: bool,
        resolution: &ExecResolution,
    ) -> Result<(), ExecDenied> {
        // Elevated bypasses the allowlist but not the ask.
        let matched = if elevated {
            None
        } else {
            match_allowlist(allowlist, resolution)
        };
        if let Some(entry) = matched {
            let _ = self.approvals.record_allowlist_use(
                &agent.id,
                &entry.pattern,
                &params.command,
                resolution.resolved_path.as_deref(),
            );
        }

        let permitted = match security {
            ExecSecurity::Full => true,
            ExecSecurity::Allowlist => matched.is_some() || elevated,
            ExecSecurity::Deny => false,
        };

        let need_ask = match ask {
            ExecAsk::Always => true,
            ExecAsk::OnMiss => !permitted,
            ExecAsk::Off => false,
        };
        if !need_ask {
            if permitted {
                return Ok(());
            }
            return Err(ExecDenied::AllowlistMiss(resolution.raw_executable.clone()));
        }

        let timeout_ms = DEFAULT_APPROVAL_TIMEOUT_MS;
        let request = ApprovalRequest {
            command: params.command.clone(),
            cwd: params.workdir.clone(),
            host: Some(ExecHost::Gateway.as_str().to_string()),
            security: Some(security.as_str().to_string()),
            ask: Some(ask.as_str().to_string()),
            agent_id: Some(agent.id.clone()),
            resolved_path: resolution.resolved_path.clone(),
            session_key: params.session_key.clone(),
            timeout_ms: Some(timeout_ms),
        };
        match self.ask_for_decision(request, timeout_ms).await {
            Some(ExecApprovalDecision::AllowOnce) => Ok(()),
            Some(ExecApprovalDecision::AllowAlways) => {
                let pattern = resolution
                    .resolved_path
                    .clone()
                    .unwrap_or_else(|| resolution.raw_executable.clone());
                let _ = self.approvals.add_allowlist_entry(&agent.id, &pattern);
                Ok(())
            }
            Some(ExecApprovalDecision::Deny) => {
                Err(ExecDenied::UserDenied(params.command.clone()))
            }
            None => match ask_fallback {
                AskFallback::Full => Ok(()),
                AskFallback::Allowlist if permitted => Ok(()),
                AskFallback::Allowlist | AskFallback::Deny => {
                    Err(ExecDenied::ApprovalTimeout(timeout_ms))
                }
            },
        }
    }

    /// Race the hub decision plane against the approval socket.
    async fn ask_for_decision(
        &self,
        request: ApprovalRequest,
        timeout_ms: u64,
    ) -> Option<ExecApprovalDecision> {
        let socket_info = self.approvals.load().ok().map(|f| f.socket);
        let record = self.manager.create_record(request.clone(), timeout_ms, None);
        let record_id = record.id.clone();

        if let Some(broadcast) = self.approval_broadcast.read().clone() {
            broadcast(record.clone());
        }

        let socket_wait = async {
            match socket_info {
                Some(info) => {
                    let path = PathBuf::from(&info.path);
                    match socket::request_decision(&path, &info.token, &record_id, &request, timeout_ms)
                        .await
                    {
                        Some(decision) => decision,
                        // No responder: let the hub path run out the clock.
                        None => std::future::pending().await,
                    }
                }
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            decision = self.manager.wait_for_decision(record, timeout_ms) => decision,
            decision = socket_wait => {
                self.manager.resolve(&record_id, decision, Some("socket"));
                Some(decision)
            }
        }
    }

    /// Gate 7: forward to a paired node that declares `system.run`.
    async fn run_on_node(
        &self,
        agent: &AgentConfig,
        params: &ExecParams,
    ) -> Result<ExecResult, ExecDenied> {
        let nodes = self
            .nodes
            .read()
            .clone()
            .ok_or_else(|| ExecDenied::NodeNotPaired("no node registry attached".to_string()))?;
        let candidates: Vec<NodeHostInfo> = nodes
            .list_nodes()
            .into_iter()
            .filter(|n| n.commands.iter().any(|c| c == "system.run"))
            .collect();

        let target = match params.node.as_deref() {
            Some(requested) => candidates
                .iter()
                .find(|n| n.node_id == requested)
                .cloned()
                .ok_or_else(|| {
                    ExecDenied::NodeNotPaired(format!(
                        "node '{requested}' is not connected or does not declare system.run"
                    ))
                })?,
            None => match candidates.len() {
                0 => {
                    return Err(ExecDenied::NodeNotPaired(
                        "no connected node declares system.run".to_string(),
                    ))
                }
                1 => candidates[0].clone(),
                _ => {
                    return Err(ExecDenied::NodeNotPaired(format!(
                        "{} nodes declare system.run; pass node to pick one",
                        candidates.len()
                    )))
                }
            },
        };

        let argv = shell_argv(target.platform.as_deref(), &params.command);
        let timeout_ms = params.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS) * 1_000;

        let mut state = ExecSessionState::new(&params.command, "", params.session_key.as_deref());
        state.cwd = params.workdir.clone();
        debug!(target: "exec", node = %target.node_id, agent = %agent.id, "forwarding exec to node");

        let output = nodes
            .run_command(&target.node_id, argv, timeout_ms)
            .await
            .map_err(|e| ExecDenied::NodeNotPaired(format!("node invoke failed: {e}")))?;

        state.append_output(&output.stdout, false);
        state.append_output(&output.stderr, true);
        state.exited = true;
        state.exit_code = Some(output.exit_code);
        Ok(finished_result(&state, params.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS)))
    }

    /// Spawn a plain-pipe child and its lifecycle task.
    fn spawn_child_lifecycle(
        &self,
        mut command: tokio::process::Command,
        state: Arc<Mutex<ExecSessionState>>,
        mut kill_rx: mpsc::UnboundedReceiver<CancelSource>,
        done_tx: watch::Sender<bool>,
        on_update: Option<UpdateCallback>,
        timeout_secs: u64,
    ) -> Result<(), ExecDenied> {
        let mut child = command
            .spawn()
            .map_err(|e| ExecDenied::Spawn(e.to_string()))?;
        state.lock().pid = child.id();

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        if let Some(stdout) = stdout {
            spawn_stream_reader(stdout, Arc::clone(&state), false, on_update.clone());
        }
        if let Some(stderr) = stderr {
            spawn_stream_reader(stderr, Arc::clone(&state), true, on_update.clone());
        }

        let exit_notes = self.exit_notes.clone();
        tokio::spawn(async move {
            let timeout = tokio::time::sleep(Duration::from_secs(timeout_secs));
            tokio::pin!(timeout);
            let mut timed_out = false;
            loop {
                tokio::select! {
                    status = child.wait() => {
                        finalize_exit(&state, status.ok(), timed_out, &done_tx, &exit_notes, &on_update);
                        break;
                    }
                    Some(source) = kill_rx.recv() => {
                        let backgrounded = state.lock().backgrounded;
                        let should_kill = match source {
                            CancelSource::Signal => !backgrounded,
                            CancelSource::Timeout | CancelSource::Operator => true,
                        };
                        if should_kill {
                            let _ = child.start_kill();
                        }
                    }
                    _ = &mut timeout, if !timed_out => {
                        timed_out = true;
                        let _ = child.start_kill();
                        // Grace period; wait() resolves right after the kill.
                        tokio::time::sleep(Duration::from_millis(TIMEOUT_GRACE_MS)).await;
                    }
                }
            }
        });
        Ok(())
    }

    /// Spawn a PTY-backed child and its lifecycle task.
    #[allow(clippy::too_many_arguments)]
    fn spawn_pty_lifecycle(
        &self,
        _agent: &AgentConfig,
        params: &ExecParams,
        cwd: &Path,
        env: &HashMap<String, String>,
        state: Arc<Mutex<ExecSessionState>>,
        mut kill_rx: mpsc::UnboundedReceiver<CancelSource>,
        done_tx: watch::Sender<bool>,
        on_update: Option<UpdateCallback>,
        timeout_secs: u64,
    ) -> Result<(), ExecDenied> {
        use portable_pty::{native_pty_system, CommandBuilder, PtySize};

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: 30,
                cols: 120,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| ExecDenied::Spawn(format!("openpty failed: {e}")))?;

        let (shell, flag) = platform_shell();
        let mut builder = CommandBuilder::new(shell);
        builder.arg(flag);
        builder.arg(&params.command);
        builder.cwd(cwd);
        for (key, value) in env {
            builder.env(key, value);
        }
        builder.env("TERM", "xterm-256color");

        let mut child = pair
            .slave
            .spawn_command(builder)
            .map_err(|e| ExecDenied::Spawn(format!("pty spawn failed: {e}")))?;
        state.lock().pid = child.process_id();

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| ExecDenied::Spawn(format!("pty reader: {e}")))?;
        let mut writer = pair
            .master
            .take_writer()
            .map_err(|e| ExecDenied::Spawn(format!("pty writer: {e}")))?;

        let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel::<String>();
        std::thread::spawn(move || {
            use std::io::{Read, Write};
            let mut buf = [0u8; 8192];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let text = String::from_utf8_lossy(&buf[..n]).to_string();
                        // Answer DSR cursor-position queries so full-screen
                        // programs keep running headless.
                        let cleaned = if text.contains("\x1b[6n") {
                            let _ = writer.write_all(b"\x1b[1;1R");
                            let _ = writer.flush();
                            text.replace("\x1b[6n", "")
                        } else {
                            text
                        };
                        if chunk_tx.send(cleaned).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let mut killer = child.clone_killer();
        let (exit_tx, mut exit_rx) = mpsc::unbounded_channel::<Option<i32>>();
        std::thread::spawn(move || {
            let code = child.wait().ok().map(|status| status.exit_code() as i32);
            let _ = exit_tx.send(code);
            drop(pair);
        });

        let exit_notes = self.exit_notes.clone();
        tokio::spawn(async move {
            let timeout = tokio::time::sleep(Duration::from_secs(timeout_secs));
            tokio::pin!(timeout);
            let mut timed_out = false;
            loop {
                tokio::select! {
                    Some(chunk) = chunk_rx.recv() => {
                        let snapshot = {
                            let mut s = state.lock();
                            s.append_output(&chunk, false);
                            s.clone()
                        };
                        if let Some(cb) = &on_update {
                            cb(snapshot);
                        }
                    }
                    exit = exit_rx.recv() => {
                        // Drain whatever the reader still buffered.
                        while let Ok(chunk) = chunk_rx.try_recv() {
                            state.lock().append_output(&chunk, false);
                        }
                        finalize_pty_exit(&state, exit.flatten(), timed_out, &done_tx, &exit_notes, &on_update);
                        break;
                    }
                    Some(source) = kill_rx.recv() => {
                        let backgrounded = state.lock().backgrounded;
                        let should_kill = match source {
                            CancelSource::Signal => !backgrounded,
                            CancelSource::Timeout | CancelSource::Operator => true,
                        };
                        if should_kill {
                            let _ = killer.kill();
                        }
                    }
                    _ = &mut timeout, if !timed_out => {
                        timed_out = true;
                        let _ = killer.kill();
                        tokio::time::sleep(Duration::from_millis(TIMEOUT_GRACE_MS)).await;
                    }
                }
            }
        });
        Ok(())
    }
}

fn running_result(state: &ExecSessionState) -> ExecResult {
    ExecResult {
        status: ExecStatus::Running,
        session_id: state.id.clone(),
        exit_code: None,
        output: state.aggregated.clone(),
        truncated: state.truncated,
        backgrounded: state.backgrounded,
        reason: None,
    }
}

fn finished_result(state: &ExecSessionState, timeout_secs: u64) -> ExecResult {
    let (status, reason) = match (state.exit_signal.as_deref(), state.exit_code) {
        (Some("SIGKILL"), _) if state.exit_code.is_none() => (
            ExecStatus::Failed,
            Some(
                ExecDenied::CommandTimedOut {
                    timeout_secs,
                    tail: format!(" :: {}", state.notify_tail()),
                }
                .to_string(),
            ),
        ),
        (_, Some(0)) => (ExecStatus::Completed, None),
        (_, Some(code)) => (
            ExecStatus::Failed,
            Some(
                ExecDenied::CommandExitedNonZero {
                    code,
                    tail: format!(" :: {}", state.notify_tail()),
                }
                .to_string(),
            ),
        ),
        (_, None) => (
            ExecStatus::Failed,
            Some(
                ExecDenied::CommandTimedOut {
                    timeout_secs,
                    tail: format!(" :: {}", state.notify_tail()),
                }
                .to_string(),
            ),
        ),
    };
    ExecResult {
        status,
        session_id: state.id.clone(),
        exit_code: state.exit_code,
        output: state.aggregated.clone(),
        truncated: state.truncated,
        backgrounded: state.backgrounded,
        reason,
    }
}

fn spawn_stream_reader<R>(
    mut stream: R,
    state: Arc<Mutex<ExecSessionState>>,
    stderr: bool,
    on_update: Option<UpdateCallback>,
) where
    R: AsyncReadExt + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; 8192];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let text = String::from_utf8_lossy(&buf[..n]).to_string();
                    let snapshot = {
                        let mut s = state.lock();
                        s.append_output(&text, stderr);
                        s.clone()
                    };
                    if let Some(cb) = &on_update {
                        cb(snapshot);
                    }
                }
            }
        }
    });
}

fn finalize_exit(
    state: &Arc<Mutex<ExecSessionState>>,
    status: Option<std::process::ExitStatus>,
    timed_out: bool,
    done_tx: &watch::Sender<bool>,
    exit_notes: &Option<mpsc::UnboundedSender<ExecExitNote>>,
    on_update: &Option<UpdateCallback>,
) {
    let snapshot = {
        let mut s = state.lock();
        s.exited = true;
        if let Some(status) = status {
            s.exit_code = status.code();
            #[cfg(unix)]
            {
                use std::os::unix::process::ExitStatusExt;
                s.exit_signal = status.signal().map(signal_name);
            }
        }
        if timed_out && s.exit_signal.is_none() && s.exit_code.is_none() {
            s.exit_signal = Some("SIGKILL".to_string());
        }
        if timed_out {
            // Timeout kills report as a kill signal even when the OS gives
            // us a plain exit code.
            s.exit_code = None;
            s.exit_signal = Some("SIGKILL".to_string());
        }
        s.clone()
    };
    deliver_exit(snapshot, state, done_tx, exit_notes, on_update);
}

fn finalize_pty_exit(
    state: &Arc<Mutex<ExecSessionState>>,
    exit_code: Option<i32>,
    timed_out: bool,
    done_tx: &watch::Sender<bool>,
    exit_notes: &Option<mpsc::UnboundedSender<ExecExitNote>>,
    on_update: &Option<UpdateCallback>,
) {
    let snapshot = {
        let mut s = state.lock();
        s.exited = true;
        s.exit_code = exit_code;
        if timed_out {
            s.exit_code = None;
            s.exit_signal = Some("SIGKILL".to_string());
        }
        s.clone()
    };
    deliver_exit(snapshot, state, done_tx, exit_notes, on_update);
}

fn deliver_exit(
    snapshot: ExecSessionState,
    state: &Arc<Mutex<ExecSessionState>>,
    done_tx: &watch::Sender<bool>,
    exit_notes: &Option<mpsc::UnboundedSender<ExecExitNote>>,
    on_update: &Option<UpdateCallback>,
) {
    if let Some(cb) = on_update {
        cb(snapshot.clone());
    }
    // Gate 11: exit notification for backgrounded sessions.
    if snapshot.notify_on_exit && snapshot.backgrounded && !snapshot.exit_notified {
        if let (Some(session_key), Some(tx)) = (&snapshot.session_key, exit_notes) {
            let note = ExecExitNote {
                session_key: session_key.clone(),
                text: format_exit_note(&snapshot),
            };
            if tx.send(note).is_ok() {
                state.lock().exit_notified = true;
            }
        }
    }
    let _ = done_tx.send(true);
}

#[cfg(unix)]
fn signal_name(signal: i32) -> String {
    match signal {
        libc::SIGHUP => "SIGHUP".to_string(),
        libc::SIGINT => "SIGINT".to_string(),
        libc::SIGKILL => "SIGKILL".to_string(),
        libc::SIGTERM => "SIGTERM".to_string(),
        libc::SIGSEGV => "SIGSEGV".to_string(),
        other => format!("SIG{other}"),
    }
}

/// Gate 5: resolve the working directory for host and container.
///
/// Relative paths resolve against the agent workspace. Directories outside
/// the workspace warn but are still permitted.
fn resolve_workdir(
    agent: &AgentConfig,
    workdir: Option<&str>,
    host: ExecHost,
) -> (PathBuf, Option<String>) {
    let host_cwd = match workdir {
        Some(dir) => {
            let path = Path::new(dir);
            if path.is_absolute() {
                path.to_path_buf()
            } else {
                agent.workspace.join(path)
            }
        }
        None => agent.workspace.clone(),
    };

    let container_cwd = if host == ExecHost::Sandbox {
        Some(match host_cwd.strip_prefix(&agent.workspace) {
            Ok(rel) if rel.as_os_str().is_empty() => "/workspace".to_string(),
            Ok(rel) => format!("/workspace/{}", rel.display()),
            Err(_) => host_cwd.display().to_string(),
        })
    } else {
        None
    };

    if host_cwd.strip_prefix(&agent.workspace).is_err() {
        warn!(
            target: "exec",
            agent = %agent.id,
            workdir = %host_cwd.display(),
            "workdir is outside the agent workspace"
        );
    }

    (host_cwd, container_cwd)
}

static LOGIN_SHELL_PATH: OnceCell<Option<String>> = OnceCell::const_new();

/// Gate 6: merged environment for the child.
async fn build_env(
    agent: &AgentConfig,
    params: &ExecParams,
    host: ExecHost,
) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = std::env::vars().collect();
    let explicit_path = params
        .env
        .as_ref()
        .map(|e| e.contains_key("PATH"))
        .unwrap_or(false);
    if let Some(extra) = &params.env {
        env.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    if host == ExecHost::Gateway && !explicit_path {
        if let Some(login_path) = LOGIN_SHELL_PATH
            .get_or_init(probe_login_shell_path)
            .await
            .clone()
        {
            env.insert("PATH".to_string(), login_path);
        }
    }

    if !agent.exec.path_prepend.is_empty() {
        let sep = if cfg!(windows) { ';' } else { ':' };
        let current = env.get("PATH").cloned().unwrap_or_default();
        let mut parts = agent.exec.path_prepend.clone();
        if !current.is_empty() {
            parts.push(current);
        }
        env.insert(
            "PATH".to_string(),
            parts.join(&sep.to_string()),
        );
    }

    env
}

/// Probe the login shell's PATH with a bounded subprocess.
async fn probe_login_shell_path() -> Option<String> {
    #[cfg(unix)]
    {
        let timeout_ms = std::env::var("CLAWDBOT_PATH_PROBE_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(1_500);
        let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
        let probe = tokio::process::Command::new(shell)
            .arg("-lc")
            .arg("printf %s \"$PATH\"")
            .stdin(std::process::Stdio::null())
            .output();
        match tokio::time::timeout(Duration::from_millis(timeout_ms), probe).await {
            Ok(Ok(output)) if output.status.success() => {
                let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
                (!path.is_empty()).then_some(path)
            }
            _ => None,
        }
    }
    #[cfg(not(unix))]
    {
        None
    }
}

fn platform_shell() -> (&'static str, &'static str) {
    if cfg!(windows) {
        ("cmd", "/c")
    } else {
        ("sh", "-lc")
    }
}

/// Argv for a remote `system.run`, shaped per node platform.
pub fn shell_argv(platform: Option<&str>, command: &str) -> Vec<String> {
    match platform {
        Some("windows") => vec![
            "cmd".to_string(),
            "/s".to_string(),
            "/c".to_string(),
            command.to_string(),
        ],
        _ => vec!["sh".to_string(), "-lc".to_string(), command.to_string()],
    }
}

/// Build the host-side command for non-PTY spawns.
fn build_host_command(
    agent: &AgentConfig,
    params: &ExecParams,
    host: ExecHost,
    host_cwd: &Path,
    container_cwd: Option<&str>,
    env: &HashMap<String, String>,
) -> tokio::process::Command {
    let mut command = if host == ExecHost::Sandbox {
        let container = agent.sandbox_container(params.session_key.as_deref());
        let mut cmd = tokio::process::Command::new("docker");
        cmd.arg("exec");
        if params.pty {
            cmd.arg("-t");
        }
        if let Some(cwd) = container_cwd {
            cmd.arg("-w").arg(cwd);
        }
        if let Some(extra) = &params.env {
            for (key, value) in extra {
                cmd.arg("--env").arg(format!("{key}={value}"));
            }
        }
        cmd.arg(&container);
        cmd.arg("sh").arg("-lc").arg(&params.command);
        cmd
    } else {
        let (shell, flag) = platform_shell();
        let mut cmd = tokio::process::Command::new(shell);
        cmd.arg(flag).arg(&params.command);
        cmd.current_dir(host_cwd);
        cmd.env_clear();
        cmd.envs(env);
        cmd
    };

    command
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(false);

    // Detach so children survive hub socket churn.
    #[cfg(unix)]
    {
        unsafe {
            command.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }
    }

    command
}

/// Resolve the first command token to an absolute executable path.
pub fn resolve_executable(command: &str, cwd: &Path, path_env: &str) -> ExecResolution {
    let raw = first_token(command);
    let executable_name = Path::new(&raw)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| raw.clone());

    let resolved_path = if raw.contains('/') || raw.contains('\\') {
        let path = Path::new(&raw);
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            cwd.join(path)
        };
        absolute.is_file().then(|| absolute.display().to_string())
    } else {
        let sep = if cfg!(windows) { ';' } else { ':' };
        path_env
            .split(sep)
            .filter(|dir| !dir.is_empty())
            .map(|dir| Path::new(dir).join(&raw))
            .find(|candidate| candidate.is_file())
            .map(|p| p.display().to_string())
    };

    ExecResolution {
        raw_executable: raw,
        resolved_path,
        executable_name,
    }
}

/// First token of a command line, honoring single and double quotes.
fn first_token(command: &str) -> String {
    let trimmed = command.trim_start();
    let mut chars = trimmed.chars();
    match chars.next() {
        Some(quote @ ('"' | '\'')) => {
            let rest: String = chars.collect();
            match rest.find(quote) {
                Some(end) => rest[..end].to_string(),
                None => rest,
            }
        }
        _ => trimmed
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_string(),
    }
}
