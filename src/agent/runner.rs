//! Session orchestrator.
//!
//! One logical worker per session key. Inbound messages are normalized,
//! matched to their (lazily created) session entity, checked for inline
//! directives, and queued. The worker drains the queue into debounced
//! batches and runs one turn at a time: build transcript, call the LLM,
//! dispatch tool calls through the policy layer and the exec engine, feed
//! results back until the model produces its final message.

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::agent::provider::{
    complete_with_retry, CompletionRequest, ContentBlock, LlmMessage, LlmProvider, StreamEvent,
    ToolDefinition,
};
use crate::agent::tool_policy::{sandbox_tools_layer, EffectiveToolPolicy, ToolLayer};
use crate::agent::{AgentConfig, AgentError};
use crate::exec::executor::ExecEngine;
use crate::exec::{CancelSource, ExecParams};
use crate::gateway::ChatState;
use crate::sessions::queue::{MessageQueue, PushOutcome, QueueSettings};
use crate::sessions::store::SessionStore;
use crate::sessions::{ChatType, SessionEntry};

/// Cap on LLM round-trips within one turn.
const MAX_TOOL_ROUNDS: usize = 16;

/// A normalized inbound chat message.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub agent_id: String,
    pub session_key: String,
    pub channel: String,
    pub chat_type: ChatType,
    pub sender: String,
    pub text: String,
}

/// Chat event pushed toward hub clients.
#[derive(Debug, Clone)]
pub struct ChatEventPayload {
    pub run_id: String,
    pub session_key: String,
    pub state: ChatState,
    pub text: Option<String>,
}

impl ChatEventPayload {
    pub fn to_value(&self) -> Value {
        json!({
            "runId": self.run_id,
            "sessionKey": self.session_key,
            "state": self.state.as_str(),
            "text": self.text,
        })
    }
}

/// Sink for chat events (the hub broadcasts them).
pub type ChatEventSink = Arc<dyn Fn(ChatEventPayload) + Send + Sync>;

struct SessionWorker {
    queue: Mutex<MessageQueue<InboundMessage>>,
    wake: Notify,
    /// Guard enforcing one in-flight turn per session key.
    turn_lock: tokio::sync::Mutex<()>,
}

/// Per-(agent, session) turn serialization and dispatch.
pub struct SessionOrchestrator {
    cfg: Value,
    store: Arc<SessionStore>,
    exec: Arc<ExecEngine>,
    provider: parking_lot::RwLock<Option<Arc<dyn LlmProvider>>>,
    workers: Mutex<HashMap<String, Arc<SessionWorker>>>,
    events: parking_lot::RwLock<Option<ChatEventSink>>,
}

impl std::fmt::Debug for SessionOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionOrchestrator")
            .field("workers", &self.workers.lock().len())
            .finish_non_exhaustive()
    }
}

impl SessionOrchestrator {
    pub fn new(cfg: Value, store: Arc<SessionStore>, exec: Arc<ExecEngine>) -> Self {
        Self {
            cfg,
            store,
            exec,
            provider: parking_lot::RwLock::new(None),
            workers: Mutex::new(HashMap::new()),
            events: parking_lot::RwLock::new(None),
        }
    }

    pub fn set_provider(&self, provider: Option<Arc<dyn LlmProvider>>) {
        *self.provider.write() = provider;
    }

    pub fn set_event_sink(&self, sink: ChatEventSink) {
        *self.events.write() = Some(sink);
    }

    pub fn session_store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Accept one inbound message: normalize, resolve the session, apply
    /// directives, enqueue, and make sure the worker is running.
    pub fn submit(self: &Arc<Self>, mut message: InboundMessage) -> Result<(), AgentError> {
        message.text = message.text.trim().to_string();
        if message.text.is_empty() {
            return Ok(());
        }

        let entry = self
            .store
            .get_or_create(&message.agent_id, &message.session_key, || {
                SessionEntry::new(message.chat_type)
            })
            .map_err(|e| AgentError::Provider(format!("session store: {e}")))?;

        let entry = self.apply_directives(&mut message, entry)?;
        if message.text.is_empty() {
            // The message was only a directive.
            return Ok(());
        }

        let settings = QueueSettings::with_overrides(
            entry.queue_debounce_ms,
            entry.queue_cap,
            entry.queue_drop,
        );

        let worker = self.worker_for(&message.session_key, settings);
        let outcome = {
            let mut queue = worker.queue.lock();
            queue.set_settings(settings);
            queue.push(message.clone())
        };
        match outcome {
            PushOutcome::Rejected => return Err(AgentError::QueueRejected),
            PushOutcome::DroppedOldest(dropped) => {
                debug!(
                    target: "sessions",
                    session = %message.session_key,
                    "queue full, dropped oldest message from {}",
                    dropped.sender
                );
            }
            PushOutcome::DroppedNewest => {
                debug!(
                    target: "sessions",
                    session = %message.session_key,
                    "queue full, dropped incoming message"
                );
            }
            PushOutcome::Queued => {}
        }
        worker.wake.notify_one();
        Ok(())
    }

    /// Inline `model=` directives: `model=provider/name` sets the override
    /// pair, `model=default` clears it (which also clears the auth-profile
    /// override). The directive token is stripped from the message text.
    fn apply_directives(
        &self,
        message: &mut InboundMessage,
        entry: SessionEntry,
    ) -> Result<SessionEntry, AgentError> {
        let text = message.text.clone();
        let Some(token) = text.split_whitespace().next() else {
            return Ok(entry);
        };
        let Some(value) = token.strip_prefix("model=") else {
            return Ok(entry);
        };
        // The directive token is consumed; the rest stays as the message.
        message.text = text[token.len()..].trim().to_string();

        let updated = self
            .store
            .update(&message.agent_id, |map| {
                let entry = map
                    .entry(message.session_key.clone())
                    .or_insert_with(|| SessionEntry::new(message.chat_type));
                if value.is_empty() || value == "default" {
                    entry.clear_model_override();
                } else if let Some((provider, model)) = value.split_once('/') {
                    entry.set_model_override(provider, model);
                } else {
                    entry.set_model_override("anthropic", value);
                }
                entry.clone()
            })
            .map_err(|e| AgentError::Provider(format!("session store: {e}")))?;
        Ok(updated)
    }

    fn worker_for(self: &Arc<Self>, session_key: &str, settings: QueueSettings) -> Arc<SessionWorker> {
        let mut workers = self.workers.lock();
        if let Some(worker) = workers.get(session_key) {
            return worker.clone();
        }
        let worker = Arc::new(SessionWorker {
            queue: Mutex::new(MessageQueue::new(settings)),
            wake: Notify::new(),
            turn_lock: tokio::sync::Mutex::new(()),
        });
        workers.insert(session_key.to_string(), worker.clone());

        let orchestrator = Arc::clone(self);
        let key = session_key.to_string();
        let task_worker = worker.clone();
        tokio::spawn(async move {
            orchestrator.worker_loop(key, task_worker).await;
        });
        worker
    }

    async fn worker_loop(self: Arc<Self>, session_key: String, worker: Arc<SessionWorker>) {
        loop {
            worker.wake.notified().await;
            loop {
                let debounce_ms = worker.queue.lock().settings().debounce_ms;
                if debounce_ms > 0 {
                    // Coalesce back-to-back messages before firing the turn.
                    tokio::time::sleep(Duration::from_millis(debounce_ms)).await;
                }
                let batch = worker.queue.lock().drain();
                if batch.is_empty() {
                    break;
                }
                // One turn in flight per session key.
                let _turn = worker.turn_lock.lock().await;
                if let Err(err) = self.run_turn(&session_key, batch).await {
                    warn!(
                        target: "sessions",
                        session = %session_key,
                        error = %err,
                        "turn failed"
                    );
                }
                if worker.queue.lock().is_empty() {
                    break;
                }
            }
        }
    }

    fn emit(&self, payload: ChatEventPayload) {
        if let Some(sink) = self.events.read().as_ref() {
            sink(payload);
        }
    }

    /// Run one turn for a batch of coalesced messages.
    async fn run_turn(
        &self,
        session_key: &str,
        batch: Vec<InboundMessage>,
    ) -> Result<(), AgentError> {
        let Some(provider) = self.provider.read().clone() else {
            return Err(AgentError::NoProvider);
        };
        let first = &batch[0];
        let agent = AgentConfig::from_config(&self.cfg, &first.agent_id);
        let run_id = Uuid::new_v4().to_string();

        let entry = self
            .store
            .resolve(&first.agent_id, session_key)
            .map_err(|e| AgentError::Provider(format!("session store: {e}")))?;
        let model = entry
            .as_ref()
            .and_then(|e| e.model_override.clone())
            .or_else(|| agent.model.clone())
            .unwrap_or_else(|| "claude-sonnet-4".to_string());

        let policy = self.effective_policy(&agent);
        let tools = policy.filter_tools(builtin_tool_definitions());

        let mut messages: Vec<LlmMessage> = batch
            .iter()
            .map(|m| LlmMessage::user_text(format!("{}: {}", m.sender, m.text)))
            .collect();

        for _round in 0..MAX_TOOL_ROUNDS {
            let request = CompletionRequest {
                model: model.clone(),
                messages: messages.clone(),
                system: None,
                tools: tools.clone(),
                max_tokens: 4096,
            };
            let mut stream = complete_with_retry(provider.as_ref(), request).await?;

            let mut assistant_blocks: Vec<ContentBlock> = Vec::new();
            let mut tool_calls: Vec<(String, String, Value)> = Vec::new();
            let mut final_text = String::new();

            while let Some(event) = stream.recv().await {
                match event {
                    StreamEvent::TextDelta { text } => {
                        final_text.push_str(&text);
                        self.emit(ChatEventPayload {
                            run_id: run_id.clone(),
                            session_key: session_key.to_string(),
                            state: ChatState::Streaming,
                            text: Some(text),
                        });
                    }
                    StreamEvent::ToolUse { id, name, input } => {
                        assistant_blocks.push(ContentBlock::ToolUse {
                            id: id.clone(),
                            name: name.clone(),
                            input: input.clone(),
                        });
                        tool_calls.push((id, name, input));
                    }
                    StreamEvent::Stop { .. } => break,
                    StreamEvent::Error { message } => {
                        return Err(AgentError::Provider(message));
                    }
                }
            }

            if tool_calls.is_empty() {
                self.emit(ChatEventPayload {
                    run_id: run_id.clone(),
                    session_key: session_key.to_string(),
                    state: ChatState::Final,
                    text: Some(final_text),
                });
                return Ok(());
            }

            if !final_text.is_empty() {
                assistant_blocks.insert(0, ContentBlock::Text { text: final_text });
            }
            messages.push(LlmMessage::assistant(assistant_blocks));

            let mut results: Vec<ContentBlock> = Vec::new();
            for (id, name, input) in tool_calls {
                self.emit(ChatEventPayload {
                    run_id: run_id.clone(),
                    session_key: session_key.to_string(),
                    state: ChatState::Tool,
                    text: Some(name.clone()),
                });
                let (content, is_error) = self
                    .dispatch_tool(&agent, session_key, &first.channel, &policy, &name, input)
                    .await;
                results.push(ContentBlock::ToolResult {
                    tool_use_id: id,
                    content,
                    is_error,
                });
            }
            messages.push(LlmMessage {
                role: crate::agent::provider::LlmRole::User,
                content: results,
            });
        }

        // Round cap reached: close the run so the client is not left
        // waiting on a stream that never finishes.
        self.emit(ChatEventPayload {
            run_id,
            session_key: session_key.to_string(),
            state: ChatState::Final,
            text: Some("(turn aborted: tool round limit reached)".to_string()),
        });
        Ok(())
    }

    fn effective_policy(&self, agent: &AgentConfig) -> EffectiveToolPolicy {
        let global = ToolLayer::from_config(self.cfg.get("tools"));
        let agent_layer = ToolLayer {
            allow: agent.tools_allow.clone(),
            deny: agent.tools_deny.clone(),
        };
        let sandbox = sandbox_tools_layer(&self.cfg, &agent.id);
        EffectiveToolPolicy::compose(&[global, agent_layer, sandbox])
    }

    /// Dispatch one tool call; the result string feeds back into the LLM.
    async fn dispatch_tool(
        &self,
        agent: &AgentConfig,
        session_key: &str,
        channel: &str,
        policy: &EffectiveToolPolicy,
        name: &str,
        input: Value,
    ) -> (String, bool) {
        if !policy.is_allowed(name) {
            return (format!("tool '{name}' denied by policy"), true);
        }
        match name {
            "exec" => {
                let mut params: ExecParams = match serde_json::from_value(input) {
                    Ok(params) => params,
                    Err(e) => return (format!("invalid exec params: {e}"), true),
                };
                params.session_key = Some(session_key.to_string());
                params.channel = Some(channel.to_string());
                match self.exec.exec(agent, params, None).await {
                    Ok(result) => {
                        let text = serde_json::to_string(&result)
                            .unwrap_or_else(|_| "exec result unserializable".to_string());
                        (text, false)
                    }
                    Err(denied) => (denied.to_string(), true),
                }
            }
            "process" => {
                let action = input.get("action").and_then(|v| v.as_str()).unwrap_or("poll");
                let id = input.get("id").and_then(|v| v.as_str()).unwrap_or_default();
                match action {
                    "list" => {
                        let sessions = self.exec.registry().list();
                        (
                            serde_json::to_string(&sessions).unwrap_or_default(),
                            false,
                        )
                    }
                    "poll" => match self.exec.registry().poll(id) {
                        Some((snapshot, stdout, stderr)) => (
                            json!({
                                "session": snapshot,
                                "stdout": stdout,
                                "stderr": stderr,
                            })
                            .to_string(),
                            false,
                        ),
                        None => (format!("unknown exec session '{id}'"), true),
                    },
                    "kill" => {
                        if self.exec.registry().kill(id, CancelSource::Operator) {
                            (format!("killed {id}"), false)
                        } else {
                            (format!("unknown exec session '{id}'"), true)
                        }
                    }
                    other => (format!("unknown process action '{other}'"), true),
                }
            }
            other => (format!("unknown tool '{other}'"), true),
        }
    }
}

/// Tool definitions the orchestrator exposes to the LLM.
pub fn builtin_tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "exec".to_string(),
            description: "Run a shell command in the agent's environment".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "command": { "type": "string" },
                    "workdir": { "type": "string" },
                    "background": { "type": "boolean" },
                    "timeout": { "type": "number" },
                    "pty": { "type": "boolean" }
                },
                "required": ["command"]
            }),
        },
        ToolDefinition {
            name: "process".to_string(),
            description: "List, poll, or kill background exec sessions".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "action": { "type": "string", "enum": ["list", "poll", "kill"] },
                    "id": { "type": "string" }
                },
                "required": ["action"]
            }),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::provider::StopReason;
    use crate::approvals::manager::ApprovalManager;
    use crate::approvals::ApprovalStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    /// Provider that replies with fixed scripts, one per call.
    struct ScriptedProvider {
        calls: AtomicUsize,
        scripts: Vec<Vec<StreamEvent>>,
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> Result<mpsc::Receiver<StreamEvent>, AgentError> {
            let index = self.calls.fetch_add(1, Ordering::SeqCst);
            let script = self
                .scripts
                .get(index)
                .cloned()
                .unwrap_or_else(|| {
                    vec![StreamEvent::Stop {
                        reason: StopReason::EndTurn,
                    }]
                });
            let (tx, rx) = mpsc::channel(16);
            tokio::spawn(async move {
                for event in script {
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
            });
            Ok(rx)
        }
    }

    fn orchestrator(dir: &TempDir, scripts: Vec<Vec<StreamEvent>>) -> Arc<SessionOrchestrator> {
        let store = Arc::new(SessionStore::new(dir.path().join("sessions")));
        let approvals = Arc::new(ApprovalStore::in_state_dir(dir.path()));
        let exec = Arc::new(ExecEngine::new(approvals, Arc::new(ApprovalManager::new())));
        let orchestrator = Arc::new(SessionOrchestrator::new(json!({}), store, exec));
        orchestrator.set_provider(Some(Arc::new(ScriptedProvider {
            calls: AtomicUsize::new(0),
            scripts,
        })));
        orchestrator
    }

    fn message(text: &str) -> InboundMessage {
        InboundMessage {
            agent_id: "main".to_string(),
            session_key: "agent:main:dm:alice".to_string(),
            channel: "telegram".to_string(),
            chat_type: ChatType::Direct,
            sender: "alice".to_string(),
            text: text.to_string(),
        }
    }

    fn collect_events(orchestrator: &Arc<SessionOrchestrator>) -> Arc<Mutex<Vec<ChatEventPayload>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        orchestrator.set_event_sink(Arc::new(move |payload| {
            sink.lock().push(payload);
        }));
        events
    }

    async fn wait_for_final(events: &Arc<Mutex<Vec<ChatEventPayload>>>) {
        for _ in 0..100 {
            if events
                .lock()
                .iter()
                .any(|e| e.state == ChatState::Final)
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("no final chat event arrived");
    }

    #[tokio::test]
    async fn test_simple_turn_emits_streaming_then_final() {
        let dir = TempDir::new().unwrap();
        let orchestrator = orchestrator(
            &dir,
            vec![vec![
                StreamEvent::TextDelta {
                    text: "hello ".to_string(),
                },
                StreamEvent::TextDelta {
                    text: "world".to_string(),
                },
                StreamEvent::Stop {
                    reason: StopReason::EndTurn,
                },
            ]],
        );
        let events = collect_events(&orchestrator);

        orchestrator.submit(message("hi there")).unwrap();
        wait_for_final(&events).await;

        let captured = events.lock();
        let states: Vec<ChatState> = captured.iter().map(|e| e.state).collect();
        assert!(states.contains(&ChatState::Streaming));
        assert_eq!(*states.last().unwrap(), ChatState::Final);
        let final_event = captured.iter().find(|e| e.state == ChatState::Final).unwrap();
        assert_eq!(final_event.text.as_deref(), Some("hello world"));
        assert_eq!(final_event.session_key, "agent:main:dm:alice");
    }

    #[tokio::test]
    async fn test_whitespace_only_message_ignored() {
        let dir = TempDir::new().unwrap();
        let orchestrator = orchestrator(&dir, vec![]);
        let events = collect_events(&orchestrator);

        orchestrator.submit(message("   ")).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(events.lock().is_empty());
    }

    #[tokio::test]
    async fn test_model_directive_sets_override() {
        let dir = TempDir::new().unwrap();
        let orchestrator = orchestrator(&dir, vec![]);

        orchestrator
            .submit(message("model=anthropic/claude-opus-4"))
            .unwrap();
        let entry = orchestrator
            .session_store()
            .resolve("main", "agent:main:dm:alice")
            .unwrap()
            .unwrap();
        assert_eq!(entry.provider_override.as_deref(), Some("anthropic"));
        assert_eq!(entry.model_override.as_deref(), Some("claude-opus-4"));

        orchestrator.submit(message("model=default")).unwrap();
        let entry = orchestrator
            .session_store()
            .resolve("main", "agent:main:dm:alice")
            .unwrap()
            .unwrap();
        assert!(entry.model_override.is_none());
        assert!(entry.provider_override.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_tool_round_trip_through_exec() {
        let dir = TempDir::new().unwrap();
        // Permit the exec: full security for agent main on the gateway host.
        let cfg = json!({
            "agents": {
                "defaults": {
                    "workspace": dir.path().display().to_string(),
                    "sandbox": { "mode": "off" },
                    "exec": { "host": "gateway", "security": "full", "ask": "off" }
                }
            }
        });
        let store = Arc::new(SessionStore::new(dir.path().join("sessions")));
        let approvals = Arc::new(ApprovalStore::in_state_dir(dir.path()));
        let exec = Arc::new(ExecEngine::new(approvals, Arc::new(ApprovalManager::new())));
        let scripted = Arc::new(SessionOrchestrator::new(cfg, store, exec));
        scripted.set_provider(Some(Arc::new(ScriptedProvider {
            calls: AtomicUsize::new(0),
            scripts: vec![
                vec![
                    StreamEvent::ToolUse {
                        id: "tool-1".to_string(),
                        name: "exec".to_string(),
                        input: json!({ "command": "echo tool-output" }),
                    },
                    StreamEvent::Stop {
                        reason: StopReason::ToolUse,
                    },
                ],
                vec![
                    StreamEvent::TextDelta {
                        text: "ran it".to_string(),
                    },
                    StreamEvent::Stop {
                        reason: StopReason::EndTurn,
                    },
                ],
            ],
        })));
        let events = collect_events(&scripted);

        scripted.submit(message("run echo please")).unwrap();
        wait_for_final(&events).await;

        let captured = events.lock();
        assert!(captured
            .iter()
            .any(|e| e.state == ChatState::Tool && e.text.as_deref() == Some("exec")));
        let final_event = captured.iter().find(|e| e.state == ChatState::Final).unwrap();
        assert_eq!(final_event.text.as_deref(), Some("ran it"));
    }

    #[tokio::test]
    async fn test_denied_tool_feeds_error_back() {
        let dir = TempDir::new().unwrap();
        let cfg = json!({ "tools": { "deny": ["exec"] } });
        let store = Arc::new(SessionStore::new(dir.path().join("sessions")));
        let approvals = Arc::new(ApprovalStore::in_state_dir(dir.path()));
        let exec = Arc::new(ExecEngine::new(approvals, Arc::new(ApprovalManager::new())));
        let orchestrator = Arc::new(SessionOrchestrator::new(cfg, store, exec));
        orchestrator.set_provider(Some(Arc::new(ScriptedProvider {
            calls: AtomicUsize::new(0),
            scripts: vec![
                vec![
                    StreamEvent::ToolUse {
                        id: "tool-1".to_string(),
                        name: "exec".to_string(),
                        input: json!({ "command": "echo blocked" }),
                    },
                    StreamEvent::Stop {
                        reason: StopReason::ToolUse,
                    },
                ],
                vec![StreamEvent::Stop {
                    reason: StopReason::EndTurn,
                }],
            ],
        })));
        let events = collect_events(&orchestrator);

        orchestrator.submit(message("try the tool")).unwrap();
        wait_for_final(&events).await;
        // The turn completed despite the denial; the model saw the error
        // and produced its final message.
        assert!(events.lock().iter().any(|e| e.state == ChatState::Final));
    }

    #[tokio::test]
    async fn test_queue_reject_policy_propagates() {
        let dir = TempDir::new().unwrap();
        let orchestrator = orchestrator(&dir, vec![]);
        // Pre-configure the session with a reject queue of cap 1 and a long
        // debounce so the first message stays queued.
        orchestrator
            .session_store()
            .update("main", |map| {
                let mut entry = SessionEntry::new(ChatType::Direct);
                entry.queue_cap = Some(1);
                entry.queue_drop = Some(crate::sessions::QueueDropPolicy::Reject);
                entry.queue_debounce_ms = Some(5_000);
                map.insert("agent:main:dm:alice".to_string(), entry);
            })
            .unwrap();

        orchestrator.submit(message("first")).unwrap();
        let second = orchestrator.submit(message("second"));
        assert!(matches!(second, Err(AgentError::QueueRejected)));
    }
}
