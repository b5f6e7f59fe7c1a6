//! The hub: WebSocket multiplexer for chat-ui, node, and cli clients.
//!
//! Every connection starts with a `hello` frame carrying role, client info,
//! and credentials. Authenticated clients get a `HelloOk` snapshot and then
//! subscribe to the event stream; each connection has its own monotonic
//! `seq` starting at 1. A client that reports a `seqGap` gets the full
//! `push.snapshot` resent rather than a partial replay.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::runner::SessionOrchestrator;
use crate::auth;
use crate::exec::executor::ExecEngine;
use crate::gateway::{
    self, EventFrame, Frame, HelloFrame, HelloOk, PolicyInfo, Snapshot, StateVersion,
    MAX_FRAME_BYTES,
};
use crate::nodes::{finalize_node_commands, NodeRegistry, NodeSession};

mod handlers;

pub use handlers::{error_shape, ErrorShape};

const TICK_INTERVAL_MS: u64 = 30_000;
const HANDSHAKE_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 30_000;
const MIN_HEARTBEAT_INTERVAL_MS: u64 = 1_000;
const MAX_HEARTBEAT_INTERVAL_MS: u64 = 300_000;
const SYSTEM_EVENT_HISTORY_MAX: usize = 1000;
const PRESENCE_TTL_MS: u64 = 5 * 60 * 1000;
const MAX_PRESENCE_ENTRIES: usize = 200;

const ALLOWED_ROLES: [&str; 3] = ["chat-ui", "node", "cli"];

pub(crate) const ERROR_INVALID_REQUEST: &str = "INVALID_REQUEST";
pub(crate) const ERROR_NOT_PAIRED: &str = "NOT_PAIRED";
pub(crate) const ERROR_UNAVAILABLE: &str = "UNAVAILABLE";
pub(crate) const ERROR_UNAUTHORIZED: &str = "UNAUTHORIZED";

/// Hub configuration derived from the config file.
#[derive(Clone, Debug, Default)]
pub struct WsServerConfig {
    pub auth: auth::ResolvedGatewayAuth,
    pub node_allow_commands: Vec<String>,
    pub node_deny_commands: Vec<String>,
}

impl WsServerConfig {
    pub fn from_config(cfg: &Value) -> Result<Self, String> {
        let nodes = cfg
            .get("gateway")
            .and_then(|g| g.get("nodes"))
            .and_then(|v| v.as_object());
        let list = |key: &str| {
            nodes
                .and_then(|n| n.get(key))
                .and_then(|v| v.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_str().map(|s| s.to_string()))
                        .collect()
                })
                .unwrap_or_default()
        };
        Ok(Self {
            auth: auth::resolve_gateway_auth(cfg)?,
            node_allow_commands: list("allowCommands"),
            node_deny_commands: list("denyCommands"),
        })
    }
}

/// Presence entry for a connected client.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub ts: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roles: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(skip)]
    pub conn_id: String,
}

/// Cached health snapshot.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub ts: u64,
    pub ok: bool,
    pub status: String,
}

impl Default for HealthSnapshot {
    fn default() -> Self {
        Self {
            ts: now_ms(),
            ok: true,
            status: "healthy".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct HeartbeatState {
    enabled: bool,
    interval_ms: u64,
    last_heartbeat_ms: Option<u64>,
}

/// System event entry (exec exit notes land here).
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemEvent {
    pub ts: u64,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
}

#[derive(Debug, Default)]
struct StateVersionTracker {
    presence: u64,
    health: u64,
}

impl StateVersionTracker {
    fn current(&self) -> StateVersion {
        StateVersion {
            presence: self.presence,
            health: self.health,
        }
    }
}

struct ConnectionHandle {
    role: String,
    tx: mpsc::UnboundedSender<Message>,
    /// Per-connection event sequence; the first event is seq 1.
    seq: AtomicU64,
}

impl ConnectionHandle {
    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Identity of one accepted connection.
#[derive(Debug, Clone)]
pub(crate) struct ConnectionContext {
    pub conn_id: String,
    pub role: String,
    pub client_name: String,
    pub instance_id: Option<String>,
}

/// Shared hub state.
pub struct WsServerState {
    config: WsServerConfig,
    raw_config: Value,
    start_time: Instant,
    pub(crate) node_registry: Arc<NodeRegistry>,
    pub(crate) exec_engine: Arc<ExecEngine>,
    pub(crate) orchestrator: Arc<SessionOrchestrator>,
    connections: Mutex<HashMap<String, Arc<ConnectionHandle>>>,
    presence: Mutex<HashMap<String, PresenceEntry>>,
    health_cache: Mutex<HealthSnapshot>,
    state_versions: Mutex<StateVersionTracker>,
    heartbeat_state: Mutex<HeartbeatState>,
    system_event_history: Mutex<Vec<SystemEvent>>,
}

impl std::fmt::Debug for WsServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsServerState")
            .field("connections", &self.connections.lock().len())
            .field("nodes", &self.node_registry)
            .finish_non_exhaustive()
    }
}

impl WsServerState {
    pub fn new(
        config: WsServerConfig,
        raw_config: Value,
        node_registry: Arc<NodeRegistry>,
        exec_engine: Arc<ExecEngine>,
        orchestrator: Arc<SessionOrchestrator>,
    ) -> Self {
        Self {
            config,
            raw_config,
            start_time: Instant::now(),
            node_registry,
            exec_engine,
            orchestrator,
            connections: Mutex::new(HashMap::new()),
            presence: Mutex::new(HashMap::new()),
            health_cache: Mutex::new(HealthSnapshot::default()),
            state_versions: Mutex::new(StateVersionTracker::default()),
            heartbeat_state: Mutex::new(HeartbeatState {
                enabled: false,
                interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
                last_heartbeat_ms: None,
            }),
            system_event_history: Mutex::new(Vec::new()),
        }
    }

    pub fn raw_config(&self) -> &Value {
        &self.raw_config
    }

    // --- presence / health / versions ---

    fn register_connection(
        &self,
        conn: &ConnectionContext,
        hello: &HelloFrame,
        tx: mpsc::UnboundedSender<Message>,
        remote_ip: Option<String>,
    ) {
        self.connections.lock().insert(
            conn.conn_id.clone(),
            Arc::new(ConnectionHandle {
                role: conn.role.clone(),
                tx,
                seq: AtomicU64::new(0),
            }),
        );
        self.presence.lock().insert(
            conn.conn_id.clone(),
            PresenceEntry {
                host: Some(hello.client_name.clone()),
                ip: remote_ip,
                version: Some(hello.client_version.clone()),
                platform: Some(hello.platform.clone()),
                mode: Some(hello.mode.clone()),
                reason: Some("connect".to_string()),
                ts: now_ms(),
                roles: Some(vec![conn.role.clone()]),
                instance_id: hello.instance_id.clone(),
                conn_id: conn.conn_id.clone(),
            },
        );
        let version = {
            let mut versions = self.state_versions.lock();
            versions.presence += 1;
            versions.current()
        };
        self.broadcast_event_versioned("presence", json!({ "presence": self.presence_list() }), version);
    }

    fn unregister_connection(&self, conn_id: &str) {
        self.connections.lock().remove(conn_id);
        self.presence.lock().remove(conn_id);
        let version = {
            let mut versions = self.state_versions.lock();
            versions.presence += 1;
            versions.current()
        };
        self.broadcast_event_versioned("presence", json!({ "presence": self.presence_list() }), version);
    }

    /// Presence snapshot: TTL-pruned, newest first, capped.
    fn presence_list(&self) -> Vec<Value> {
        let cutoff = now_ms().saturating_sub(PRESENCE_TTL_MS);
        let mut presence = self.presence.lock();
        presence.retain(|_, entry| entry.ts >= cutoff);
        let mut entries: Vec<(u64, Value)> = presence
            .values()
            .filter(|e| e.reason.as_deref() != Some("disconnect"))
            .map(|e| (e.ts, serde_json::to_value(e).unwrap_or(json!({}))))
            .collect();
        entries.sort_by(|a, b| b.0.cmp(&a.0));
        entries
            .into_iter()
            .take(MAX_PRESENCE_ENTRIES)
            .map(|(_, v)| v)
            .collect()
    }

    pub fn health_snapshot(&self) -> HealthSnapshot {
        self.health_cache.lock().clone()
    }

    /// Update health; broadcasts only when the status flips.
    pub fn update_health(&self, ok: bool, status: &str) {
        let changed = {
            let mut cache = self.health_cache.lock();
            let changed = cache.ok != ok || cache.status != status;
            *cache = HealthSnapshot {
                ts: now_ms(),
                ok,
                status: status.to_string(),
            };
            changed
        };
        if changed {
            let version = {
                let mut versions = self.state_versions.lock();
                versions.health += 1;
                versions.current()
            };
            let payload = serde_json::to_value(self.health_snapshot()).unwrap_or(json!({}));
            self.broadcast_event_versioned("health", payload, version);
        }
    }

    // --- system events / heartbeat ---

    pub fn enqueue_system_event(&self, event: SystemEvent) {
        let mut history = self.system_event_history.lock();
        history.push(event);
        if history.len() > SYSTEM_EVENT_HISTORY_MAX {
            let excess = history.len() - SYSTEM_EVENT_HISTORY_MAX;
            history.drain(0..excess);
        }
    }

    pub fn system_event_history(&self) -> Vec<SystemEvent> {
        self.system_event_history.lock().clone()
    }

    pub(crate) fn heartbeat_settings(&self) -> (bool, u64, Option<u64>) {
        let state = self.heartbeat_state.lock();
        (state.enabled, state.interval_ms, state.last_heartbeat_ms)
    }

    pub(crate) fn set_heartbeat_settings(&self, enabled: bool, interval_ms: u64) -> (bool, u64) {
        let mut state = self.heartbeat_state.lock();
        state.enabled = enabled;
        state.interval_ms = interval_ms.clamp(MIN_HEARTBEAT_INTERVAL_MS, MAX_HEARTBEAT_INTERVAL_MS);
        (state.enabled, state.interval_ms)
    }

    /// Record a heartbeat wake and broadcast it.
    pub fn wake(&self, reason: &str) -> u64 {
        let ts = {
            let mut state = self.heartbeat_state.lock();
            let ts = now_ms();
            state.last_heartbeat_ms = Some(ts);
            ts
        };
        self.broadcast_event("heartbeat", json!({ "ts": ts, "reason": reason }));
        ts
    }

    // --- frame delivery ---

    /// Send an event to one connection with its own next seq.
    pub(crate) fn send_event_to_connection(
        &self,
        conn_id: &str,
        event: &str,
        payload: Value,
    ) -> bool {
        let handle = {
            let conns = self.connections.lock();
            match conns.get(conn_id) {
                Some(handle) => Arc::clone(handle),
                None => return false,
            }
        };
        let frame = Frame::Event(EventFrame {
            event: event.to_string(),
            payload: Some(payload),
            seq: Some(handle.next_seq()),
            state_version: None,
            extra: Map::new(),
        });
        send_frame(&handle.tx, &frame)
    }

    /// Broadcast an event to every non-node connection.
    pub fn broadcast_event(&self, event: &str, payload: Value) {
        self.broadcast(event, payload, None);
    }

    fn broadcast_event_versioned(&self, event: &str, payload: Value, version: StateVersion) {
        self.broadcast(event, payload, Some(version));
    }

    fn broadcast(&self, event: &str, payload: Value, version: Option<StateVersion>) {
        let handles: Vec<Arc<ConnectionHandle>> = {
            let conns = self.connections.lock();
            conns
                .values()
                .filter(|handle| handle.role != "node")
                .map(Arc::clone)
                .collect()
        };
        let mut dead = 0usize;
        for handle in handles {
            let frame = Frame::Event(EventFrame {
                event: event.to_string(),
                payload: Some(payload.clone()),
                seq: Some(handle.next_seq()),
                state_version: version,
                extra: Map::new(),
            });
            if !send_frame(&handle.tx, &frame) {
                dead += 1;
            }
        }
        if dead > 0 {
            debug!(target: "ws", "{dead} dead connections during broadcast");
        }
    }

    /// Build the HelloOk block for one connection.
    pub(crate) fn build_hello_ok(&self, conn_id: &str) -> HelloOk {
        let mut server = Map::new();
        server.insert("version".to_string(), json!(env!("CARGO_PKG_VERSION")));
        server.insert("connId".to_string(), json!(conn_id));

        let mut features = Map::new();
        features.insert("methods".to_string(), json!(handlers::GATEWAY_METHODS));
        features.insert("events".to_string(), json!(handlers::GATEWAY_EVENTS));

        HelloOk {
            payload_type: "hello",
            protocol: gateway::PROTOCOL_VERSION,
            server,
            features,
            snapshot: Snapshot {
                presence: self.presence_list(),
                health: serde_json::to_value(self.health_snapshot()).unwrap_or(json!({})),
                state_version: self.state_versions.lock().current(),
                uptime_ms: self.start_time.elapsed().as_millis() as u64,
                config_path: Some(crate::config::config_path().display().to_string()),
                state_dir: Some(crate::config::state_dir().display().to_string()),
                session_defaults: None,
            },
            canvas_host_url: None,
            auth: None,
            policy: PolicyInfo {
                max_payload: MAX_FRAME_BYTES,
                tick_interval_ms: TICK_INTERVAL_MS,
            },
        }
    }

    /// Answer a `seqGap` with the full snapshot.
    fn send_push_snapshot(&self, conn_id: &str) {
        let hello = self.build_hello_ok(conn_id);
        let Ok(Value::Object(mut body)) = serde_json::to_value(&hello) else {
            return;
        };
        body.remove("type");
        let frame = Frame::PushSnapshot(gateway::PushSnapshotFrame { body });
        let handle = {
            let conns = self.connections.lock();
            conns.get(conn_id).map(Arc::clone)
        };
        if let Some(handle) = handle {
            let _ = send_frame(&handle.tx, &frame);
        }
    }
}

/// Wire the runtime event flows into the hub: chat events, exec approval
/// broadcasts, and exec exit notes. Call once after construction.
pub fn wire_runtime(
    state: &Arc<WsServerState>,
    mut exit_notes: mpsc::UnboundedReceiver<crate::exec::ExecExitNote>,
) {
    let chat_state = Arc::clone(state);
    state.orchestrator.set_event_sink(Arc::new(move |payload| {
        chat_state.broadcast_event("chat", payload.to_value());
    }));

    let approval_state = Arc::clone(state);
    state
        .exec_engine
        .set_approval_broadcast(Arc::new(move |record| {
            approval_state.broadcast_event(
                "exec.approval.requested",
                serde_json::to_value(&record).unwrap_or(json!({})),
            );
        }));

    state
        .exec_engine
        .set_node_host(Arc::new(handlers::HubNodeHost::new(Arc::downgrade(state))));

    spawn_heartbeat_task(Arc::clone(state));

    let note_state = Arc::clone(state);
    tokio::spawn(async move {
        while let Some(note) = exit_notes.recv().await {
            note_state.enqueue_system_event(SystemEvent {
                ts: now_ms(),
                text: note.text.clone(),
                session_key: Some(note.session_key.clone()),
            });
            note_state.wake("exec-exit");
        }
    });
}

// ---------------------------------------------------------------------------
// Connection lifecycle
// ---------------------------------------------------------------------------

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<WsServerState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, addr))
        .into_response()
}

async fn handle_socket(socket: WebSocket, state: Arc<WsServerState>, remote_addr: SocketAddr) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    if let Some(conn) = perform_handshake(&mut receiver, &tx, &state, remote_addr).await {
        run_message_loop(&mut receiver, &tx, &state, &conn).await;
        state.unregister_connection(&conn.conn_id);
        if let Some(node_id) = state.node_registry.unregister(&conn.conn_id) {
            info!(target: "nodes", node = %node_id, "node disconnected");
        }
    }

    drop(tx);
    let _ = send_task.await;
}

async fn perform_handshake(
    receiver: &mut futures_util::stream::SplitStream<WebSocket>,
    tx: &mpsc::UnboundedSender<Message>,
    state: &Arc<WsServerState>,
    remote_addr: SocketAddr,
) -> Option<ConnectionContext> {
    let text = match recv_text_with_timeout(receiver, HANDSHAKE_TIMEOUT_MS).await {
        Some(text) => text,
        None => {
            send_close(tx, 1008, "handshake timeout");
            return None;
        }
    };

    let hello = match gateway::decode_frame(&text) {
        Ok(Frame::Hello(hello)) => hello,
        Ok(_) => {
            send_close(tx, 1008, "first frame must be hello");
            return None;
        }
        Err(gateway::FrameError::TooLarge { .. }) => {
            send_close(tx, 1009, gateway::FRAME_TOO_LARGE_REASON);
            return None;
        }
        Err(err @ gateway::FrameError::TooDeep { .. }) => {
            send_close(tx, 1008, &err.to_string());
            return None;
        }
        Err(_) => {
            send_close(tx, 1008, "invalid hello frame");
            return None;
        }
    };

    if !ALLOWED_ROLES.contains(&hello.role.as_str())
        || hello.client_name.trim().is_empty()
        || hello.client_version.trim().is_empty()
    {
        send_close(tx, 1008, "invalid hello params");
        return None;
    }

    let is_local = auth::is_local_direct(remote_addr);
    let result = auth::authorize_gateway_connect(
        &state.config.auth,
        hello.token.as_deref(),
        hello.password.as_deref(),
        is_local,
    );
    if !result.ok {
        let reason = result
            .reason
            .map(|r| r.message())
            .unwrap_or("unauthorized");
        warn!(target: "ws", client = %hello.client_name, "handshake rejected: {reason}");
        send_close(tx, 1008, reason);
        return None;
    }

    let conn_id = Uuid::new_v4().to_string();
    let conn = ConnectionContext {
        conn_id: conn_id.clone(),
        role: hello.role.clone(),
        client_name: hello.client_name.clone(),
        instance_id: hello.instance_id.clone(),
    };

    if hello.role == "node" {
        let node_id = hello
            .instance_id
            .clone()
            .unwrap_or_else(|| hello.client_name.clone());
        let commands = finalize_node_commands(
            Some(hello.platform.as_str()),
            hello.commands.as_deref().unwrap_or(&[]),
            &state.config.node_allow_commands,
            &state.config.node_deny_commands,
        );
        state.node_registry.register(NodeSession {
            node_id: node_id.clone(),
            conn_id: conn_id.clone(),
            display_name: Some(hello.client_name.clone()),
            platform: Some(hello.platform.clone()),
            commands: commands.into_iter().collect(),
            remote_ip: (!is_local).then(|| remote_addr.ip().to_string()),
            connected_at_ms: now_ms(),
            last_seen_ms: None,
        });
        info!(target: "nodes", node = %node_id, "node connected");
    }

    let remote_ip = (!is_local).then(|| remote_addr.ip().to_string());
    state.register_connection(&conn, &hello, tx.clone(), remote_ip);

    // HelloOk goes out as its own `type: "hello"` frame.
    let hello_ok = state.build_hello_ok(&conn_id);
    if let Ok(payload) = serde_json::to_string(&hello_ok) {
        let _ = tx.send(Message::Text(payload));
    }

    spawn_tick_task(state, &conn_id);
    Some(conn)
}

async fn run_message_loop(
    receiver: &mut futures_util::stream::SplitStream<WebSocket>,
    tx: &mpsc::UnboundedSender<Message>,
    state: &Arc<WsServerState>,
    conn: &ConnectionContext,
) {
    while let Some(next) = receiver.next().await {
        let msg = match next {
            Ok(msg) => msg,
            Err(_) => break,
        };
        let text = match msg {
            Message::Text(text) => text,
            Message::Binary(_) => {
                send_close(tx, 1003, "binary frames not supported");
                break;
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        let frame = match gateway::decode_frame(&text) {
            Ok(frame) => frame,
            Err(gateway::FrameError::TooLarge { .. }) => {
                send_close(tx, 1009, gateway::FRAME_TOO_LARGE_REASON);
                break;
            }
            Err(err @ gateway::FrameError::TooDeep { .. }) => {
                send_close(tx, 1008, &err.to_string());
                break;
            }
            Err(err) => {
                debug!(target: "ws", error = %err, "dropping invalid frame");
                send_close(tx, 1008, "invalid frame");
                break;
            }
        };

        match frame {
            Frame::RpcReq(req) => {
                let result =
                    handlers::dispatch_method(&req.method, req.params.as_ref(), state, conn).await;
                let response = match result {
                    Ok(payload) => Frame::RpcRes(gateway::RpcResFrame {
                        id: req.id,
                        ok: true,
                        payload: Some(payload),
                        error: None,
                        extra: Map::new(),
                    }),
                    Err(err) => Frame::RpcRes(gateway::RpcResFrame {
                        id: req.id,
                        ok: false,
                        payload: None,
                        error: Some(err.into_payload()),
                        extra: Map::new(),
                    }),
                };
                let _ = send_frame(tx, &response);
            }
            Frame::SeqGap(gap) => {
                debug!(
                    target: "ws",
                    conn = %conn.conn_id,
                    expected = gap.expected,
                    received = gap.received,
                    "client reported seq gap, resending snapshot"
                );
                state.send_push_snapshot(&conn.conn_id);
            }
            Frame::Event(event) => {
                // Nodes report results/events through rpc.req; a raw event
                // frame from a node is forwarded to operators as-is.
                if conn.role == "node" {
                    state.broadcast_event(
                        "node.event",
                        json!({
                            "nodeId": conn.instance_id.clone().unwrap_or_else(|| conn.client_name.clone()),
                            "event": event.event,
                            "payload": event.payload,
                            "ts": now_ms(),
                        }),
                    );
                }
            }
            Frame::Hello(_) => {
                send_close(tx, 1008, "hello already completed");
                break;
            }
            Frame::RpcRes(_) | Frame::PushSnapshot(_) => {
                // Server-to-client frames; ignore from clients.
            }
        }
    }
}

/// Periodic heartbeat broadcast while enabled via `set-heartbeats`.
pub fn spawn_heartbeat_task(state: Arc<WsServerState>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let (enabled, interval_ms, _) = state.heartbeat_settings();
            if !enabled {
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
            tokio::time::sleep(Duration::from_millis(interval_ms.max(MIN_HEARTBEAT_INTERVAL_MS)))
                .await;
            let (still_enabled, _, _) = state.heartbeat_settings();
            if still_enabled {
                state.wake("interval");
            }
        }
    })
}

fn spawn_tick_task(state: &Arc<WsServerState>, conn_id: &str) {
    let state = Arc::clone(state);
    let conn_id = conn_id.to_string();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(TICK_INTERVAL_MS));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if !state.send_event_to_connection(&conn_id, "tick", json!({ "ts": now_ms() })) {
                break;
            }
        }
    });
}

async fn recv_text_with_timeout(
    receiver: &mut futures_util::stream::SplitStream<WebSocket>,
    timeout_ms: u64,
) -> Option<String> {
    let deadline = Duration::from_millis(timeout_ms);
    loop {
        let next = tokio::time::timeout(deadline, receiver.next()).await.ok()??;
        match next.ok()? {
            Message::Text(text) => return Some(text),
            Message::Ping(_) | Message::Pong(_) => continue,
            _ => return None,
        }
    }
}

fn send_frame(tx: &mpsc::UnboundedSender<Message>, frame: &Frame) -> bool {
    match gateway::encode_frame(frame) {
        Ok(text) => tx.send(Message::Text(text)).is_ok(),
        Err(err) => {
            warn!(target: "ws", error = %err, "failed to encode frame");
            false
        }
    }
}

fn send_close(tx: &mpsc::UnboundedSender<Message>, code: u16, reason: &str) {
    let _ = tx.send(Message::Close(Some(axum::extract::ws::CloseFrame {
        code,
        reason: reason.to_string().into(),
    })));
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
    use crate::approvals::manager::ApprovalManager;
    use crate::approvals::ApprovalStore;
    use crate::sessions::store::SessionStore;
    use tempfile::TempDir;

    pub(crate) fn test_state(dir: &TempDir) -> Arc<WsServerState> {
        let store = Arc::new(SessionStore::new(dir.path().join("sessions")));
        let approvals = Arc::new(ApprovalStore::in_state_dir(dir.path()));
        let exec = Arc::new(ExecEngine::new(approvals, Arc::new(ApprovalManager::new())));
        let registry = Arc::new(NodeRegistry::new());
        let orchestrator = Arc::new(SessionOrchestrator::new(
            json!({}),
            store,
            Arc::clone(&exec),
        ));
        Arc::new(WsServerState::new(
            WsServerConfig::default(),
            json!({}),
            registry,
            exec,
            orchestrator,
        ))
    }

    fn register_test_conn(
        state: &Arc<WsServerState>,
        conn_id: &str,
        role: &str,
    ) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = ConnectionContext {
            conn_id: conn_id.to_string(),
            role: role.to_string(),
            client_name: "test".to_string(),
            instance_id: None,
        };
        let hello = HelloFrame {
            role: role.to_string(),
            client_name: "test".to_string(),
            client_version: "1.0.0".to_string(),
            platform: "linux".to_string(),
            mode: "test".to_string(),
            instance_id: None,
            scopes: vec![],
            commands: None,
            token: None,
            password: None,
            extra: Map::new(),
        };
        state.register_connection(&conn, &hello, tx, None);
        rx
    }

    fn next_event(rx: &mut mpsc::UnboundedReceiver<Message>) -> Option<EventFrame> {
        while let Ok(msg) = rx.try_recv() {
            if let Message::Text(text) = msg {
                if let Ok(Frame::Event(event)) = gateway::decode_frame(&text) {
                    return Some(event);
                }
            }
        }
        None
    }

    #[tokio::test]
    async fn test_event_seq_is_monotonic_per_connection() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        let mut rx = register_test_conn(&state, "conn-1", "chat-ui");
        // Drain the presence event from registration.
        let _ = next_event(&mut rx);

        state.broadcast_event("chat", json!({ "n": 1 }));
        state.broadcast_event("chat", json!({ "n": 2 }));
        state.broadcast_event("chat", json!({ "n": 3 }));

        let mut seqs = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let Message::Text(text) = msg {
                if let Ok(Frame::Event(event)) = gateway::decode_frame(&text) {
                    seqs.push(event.seq.unwrap());
                }
            }
        }
        let sorted = {
            let mut copy = seqs.clone();
            copy.sort_unstable();
            copy
        };
        assert_eq!(seqs, sorted, "event seq must be monotonic");
        assert!(seqs.windows(2).all(|w| w[1] == w[0] + 1));
    }

    #[tokio::test]
    async fn test_node_connections_excluded_from_broadcast() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        let mut operator_rx = register_test_conn(&state, "op-1", "chat-ui");
        let mut node_rx = register_test_conn(&state, "node-1", "node");
        let _ = next_event(&mut operator_rx);
        while next_event(&mut node_rx).is_some() {}

        state.broadcast_event("chat", json!({ "hello": true }));

        let operator_saw = std::iter::from_fn(|| next_event(&mut operator_rx))
            .any(|e| e.event == "chat");
        assert!(operator_saw);
        let node_saw = std::iter::from_fn(|| next_event(&mut node_rx)).any(|e| e.event == "chat");
        assert!(!node_saw);
    }

    #[tokio::test]
    async fn test_health_update_broadcasts_only_on_change() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        let mut rx = register_test_conn(&state, "conn-1", "chat-ui");
        let _ = next_event(&mut rx);

        state.update_health(false, "degraded");
        state.update_health(false, "degraded");

        let mut health_events = 0;
        while let Some(event) = next_event(&mut rx) {
            if event.event == "health" {
                health_events += 1;
            }
        }
        assert_eq!(health_events, 1);
        assert!(!state.health_snapshot().ok);
    }

    #[tokio::test]
    async fn test_hello_ok_snapshot_shape() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        let hello = state.build_hello_ok("conn-x");
        let value = serde_json::to_value(&hello).unwrap();
        assert_eq!(value["type"], "hello");
        assert_eq!(value["_protocol"], gateway::PROTOCOL_VERSION);
        assert!(value["snapshot"]["uptimeMs"].is_u64());
        assert!(value["snapshot"]["stateVersion"]["presence"].is_u64());
        assert!(value["policy"]["maxPayload"].is_u64());
        assert!(value["features"]["methods"]
            .as_array()
            .unwrap()
            .iter()
            .any(|m| m == "node.invoke"));
    }

    #[tokio::test]
    async fn test_system_event_history_cap() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        for i in 0..(SYSTEM_EVENT_HISTORY_MAX + 10) {
            state.enqueue_system_event(SystemEvent {
                ts: now_ms(),
                text: format!("event {i}"),
                session_key: None,
            });
        }
        let history = state.system_event_history();
        assert_eq!(history.len(), SYSTEM_EVENT_HISTORY_MAX);
        assert!(history.last().unwrap().text.ends_with("1009"));
    }

    #[tokio::test]
    async fn test_wire_runtime_routes_exit_notes() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        let (tx, rx) = mpsc::unbounded_channel();
        wire_runtime(&state, rx);

        tx.send(crate::exec::ExecExitNote {
            session_key: "agent:main:main".to_string(),
            text: "Exec completed (abc12345, 0) :: done".to_string(),
        })
        .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let history = state.system_event_history();
        assert_eq!(history.len(), 1);
        assert!(history[0].text.starts_with("Exec completed"));
        let (_, _, last) = state.heartbeat_settings();
        assert!(last.is_some());
    }
}
