//! Node registry and invoke routing.
//!
//! Nodes are remote peers (phones, desktops) that attach over the hub with
//! `role=node` and declare the commands they expose. Invokes are tracked as
//! tickets keyed `(nodeId, idempotencyKey)`: within the retention window the
//! first invocation sends one request to the node and every later identical
//! call attaches to the same ticket, so exactly one request reaches the
//! node. Node disconnect fails all of its in-flight tickets.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::oneshot;
use uuid::Uuid;

/// How long a resolved ticket keeps deduplicating identical invokes.
pub const INVOKE_RETENTION_MS: u64 = 5 * 60 * 1000;

/// Default node invoke deadline.
pub const DEFAULT_INVOKE_TIMEOUT_MS: u64 = 30_000;

/// Commands each platform may expose, regardless of what a node declares.
pub fn platform_command_catalog(platform: &str) -> &'static [&'static str] {
    match platform {
        "ios" => &[
            "canvas.snapshot",
            "canvas.show",
            "canvas.hide",
            "camera.capture",
            "location.get",
            "system.notify",
        ],
        "mac" => &[
            "system.run",
            "system.notify",
            "canvas.snapshot",
            "camera.capture",
        ],
        "linux" | "windows" => &["system.run", "system.notify"],
        _ => &[],
    }
}

/// Filter a node's declared commands through the platform catalog and the
/// gateway's configured allow/deny lists.
pub fn finalize_node_commands(
    platform: Option<&str>,
    declared: &[String],
    allow: &[String],
    deny: &[String],
) -> Vec<String> {
    let catalog = platform.map(platform_command_catalog).unwrap_or(&[]);
    declared
        .iter()
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .filter(|c| catalog.contains(&c.as_str()))
        .filter(|c| allow.is_empty() || allow.iter().any(|a| a == c))
        .filter(|c| !deny.iter().any(|d| d == c))
        .collect()
}

/// A connected node peer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSession {
    pub node_id: String,
    #[serde(skip)]
    pub conn_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    pub commands: HashSet<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_ip: Option<String>,
    pub connected_at_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen_ms: Option<u64>,
}

/// Error block of a failed invoke.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeInvokeError {
    pub code: Option<String>,
    pub message: Option<String>,
}

/// Result of one invoke, as reported by the node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeInvokeResult {
    pub ok: bool,
    /// The node's payload, serialized; `None` means an explicit null.
    pub payload_json: Option<String>,
    pub error: Option<NodeInvokeError>,
}

impl NodeInvokeResult {
    pub fn disconnected() -> Self {
        Self {
            ok: false,
            payload_json: None,
            error: Some(NodeInvokeError {
                code: Some("NOT_CONNECTED".to_string()),
                message: Some("node-disconnected".to_string()),
            }),
        }
    }
}

/// How a `begin_invoke` call proceeds.
pub enum BeginInvoke {
    /// A fresh ticket: send `node.invoke.request` with this id, then await.
    Send {
        ticket_id: String,
        receiver: oneshot::Receiver<NodeInvokeResult>,
    },
    /// An identical invoke is already in flight: just await.
    Attach {
        ticket_id: String,
        receiver: oneshot::Receiver<NodeInvokeResult>,
    },
    /// An identical invoke resolved within the retention window.
    Replay(NodeInvokeResult),
}

struct PendingTicket {
    node_id: String,
    command: String,
    idempotency_key: String,
    responders: Vec<oneshot::Sender<NodeInvokeResult>>,
}

struct ResolvedTicket {
    result: NodeInvokeResult,
    resolved_at_ms: u64,
}

#[derive(Default)]
struct RegistryInner {
    nodes_by_id: HashMap<String, NodeSession>,
    nodes_by_conn: HashMap<String, String>,
    pending: HashMap<String, PendingTicket>,
    /// (node_id, idempotency_key) → pending ticket id.
    in_flight: HashMap<(String, String), String>,
    /// (node_id, idempotency_key) → recently resolved result.
    recent: HashMap<(String, String), ResolvedTicket>,
}

/// Thread-safe registry of connected nodes and invoke tickets.
#[derive(Default)]
pub struct NodeRegistry {
    inner: RwLock<RegistryInner>,
}

impl std::fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("NodeRegistry")
            .field("nodes", &inner.nodes_by_id.len())
            .field("pending", &inner.pending.len())
            .finish()
    }
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node session. A reconnecting node replaces its previous
    /// registration; the stale connection's tickets fail.
    pub fn register(&self, session: NodeSession) {
        let mut inner = self.inner.write();
        let conn_id = session.conn_id.clone();
        let node_id = session.node_id.clone();
        if let Some(previous) = inner.nodes_by_conn.remove(&conn_id) {
            inner.nodes_by_id.remove(&previous);
        }
        if let Some(stale_conn) = inner
            .nodes_by_conn
            .iter()
            .find_map(|(conn, id)| (id == &node_id).then(|| conn.clone()))
        {
            inner.nodes_by_conn.remove(&stale_conn);
        }
        inner.nodes_by_id.insert(node_id.clone(), session);
        inner.nodes_by_conn.insert(conn_id, node_id);
    }

    /// Drop the node attached to a connection, failing its in-flight
    /// tickets with `node-disconnected`. Returns the node id, if any.
    pub fn unregister(&self, conn_id: &str) -> Option<String> {
        let mut inner = self.inner.write();
        let node_id = inner.nodes_by_conn.remove(conn_id)?;
        inner.nodes_by_id.remove(&node_id);

        let doomed: Vec<String> = inner
            .pending
            .iter()
            .filter(|(_, ticket)| ticket.node_id == node_id)
            .map(|(id, _)| id.clone())
            .collect();
        for ticket_id in doomed {
            if let Some(ticket) = inner.pending.remove(&ticket_id) {
                inner
                    .in_flight
                    .remove(&(ticket.node_id.clone(), ticket.idempotency_key.clone()));
                for responder in ticket.responders {
                    let _ = responder.send(NodeInvokeResult::disconnected());
                }
            }
        }
        Some(node_id)
    }

    pub fn get(&self, node_id: &str) -> Option<NodeSession> {
        self.inner.read().nodes_by_id.get(node_id).cloned()
    }

    pub fn list_connected(&self) -> Vec<NodeSession> {
        self.inner.read().nodes_by_id.values().cloned().collect()
    }

    pub fn conn_id_for(&self, node_id: &str) -> Option<String> {
        self.inner
            .read()
            .nodes_by_id
            .get(node_id)
            .map(|s| s.conn_id.clone())
    }

    pub fn touch(&self, node_id: &str) {
        if let Some(session) = self.inner.write().nodes_by_id.get_mut(node_id) {
            session.last_seen_ms = Some(now_ms());
        }
    }

    /// Check a command against the node's declared set and the platform
    /// catalog. Both must admit it.
    pub fn command_allowed(&self, node_id: &str, command: &str) -> Result<(), String> {
        let inner = self.inner.read();
        let Some(node) = inner.nodes_by_id.get(node_id) else {
            return Err("node not connected".to_string());
        };
        if !node.commands.contains(command) {
            return Err(format!("node command not allowed: {command}"));
        }
        let catalog = node
            .platform
            .as_deref()
            .map(platform_command_catalog)
            .unwrap_or(&[]);
        if !catalog.contains(&command) {
            return Err(format!("node command not allowed: {command}"));
        }
        Ok(())
    }

    /// Open (or join) the ticket for `(node_id, idempotency_key)`.
    pub fn begin_invoke(
        &self,
        node_id: &str,
        command: &str,
        idempotency_key: &str,
    ) -> BeginInvoke {
        let mut inner = self.inner.write();
        let dedup_key = (node_id.to_string(), idempotency_key.to_string());

        // Replay a result resolved within the retention window.
        if let Some(resolved) = inner.recent.get(&dedup_key) {
            if now_ms().saturating_sub(resolved.resolved_at_ms) <= INVOKE_RETENTION_MS {
                return BeginInvoke::Replay(resolved.result.clone());
            }
            inner.recent.remove(&dedup_key);
        }

        // Attach to an in-flight ticket.
        if let Some(ticket_id) = inner.in_flight.get(&dedup_key).cloned() {
            if let Some(ticket) = inner.pending.get_mut(&ticket_id) {
                let (tx, rx) = oneshot::channel();
                ticket.responders.push(tx);
                return BeginInvoke::Attach {
                    ticket_id,
                    receiver: rx,
                };
            }
        }

        let ticket_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        inner.pending.insert(
            ticket_id.clone(),
            PendingTicket {
                node_id: node_id.to_string(),
                command: command.to_string(),
                idempotency_key: idempotency_key.to_string(),
                responders: vec![tx],
            },
        );
        inner.in_flight.insert(dedup_key, ticket_id.clone());
        BeginInvoke::Send {
            ticket_id,
            receiver: rx,
        }
    }

    /// Resolve a ticket with the node's result. The node id must match the
    /// ticket's. Every attached responder observes the result.
    pub fn resolve_invoke(
        &self,
        ticket_id: &str,
        node_id: &str,
        result: NodeInvokeResult,
    ) -> bool {
        let mut inner = self.inner.write();
        let Some(ticket) = inner.pending.get(ticket_id) else {
            return false;
        };
        if ticket.node_id != node_id {
            return false;
        }
        let ticket = inner.pending.remove(ticket_id).expect("checked above");
        let dedup_key = (ticket.node_id.clone(), ticket.idempotency_key.clone());
        inner.in_flight.remove(&dedup_key);
        inner.recent.insert(
            dedup_key,
            ResolvedTicket {
                result: result.clone(),
                resolved_at_ms: now_ms(),
            },
        );
        for responder in ticket.responders {
            let _ = responder.send(result.clone());
        }
        true
    }

    /// Abandon a ticket (caller-side deadline). Later identical invokes
    /// start fresh.
    pub fn abandon_invoke(&self, ticket_id: &str) {
        let mut inner = self.inner.write();
        if let Some(ticket) = inner.pending.remove(ticket_id) {
            inner
                .in_flight
                .remove(&(ticket.node_id, ticket.idempotency_key));
        }
    }

    /// Command name a pending ticket carries (diagnostics).
    pub fn pending_command(&self, ticket_id: &str) -> Option<String> {
        self.inner
            .read()
            .pending
            .get(ticket_id)
            .map(|t| t.command.clone())
    }

    /// Drop expired entries from the retention cache.
    pub fn cleanup_retention(&self) {
        let cutoff = now_ms().saturating_sub(INVOKE_RETENTION_MS);
        self.inner
            .write()
            .recent
            .retain(|_, resolved| resolved.resolved_at_ms > cutoff);
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}
