//! Pending approval decision plane.
//!
//! When a gated command needs a human decision, the executor registers a
//! pending record here and waits. Decisions can arrive from two directions:
//! an operator resolving `exec.approval.resolve` over the hub, or a
//! responder on the approval socket. Whichever answers first wins; a timeout
//! yields `None` and the caller falls back per `askFallback`.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use uuid::Uuid;

use super::{now_ms, ExecApprovalDecision};

/// Details of the command awaiting a decision.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ask: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// A registered approval request with its lifecycle timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRecord {
    pub id: String,
    pub request: ApprovalRequest,
    pub created_at_ms: u64,
    pub expires_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<ExecApprovalDecision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
}

struct PendingEntry {
    record: ApprovalRecord,
    responder: oneshot::Sender<Option<ExecApprovalDecision>>,
    expires_at: Instant,
}

/// Tracks pending approval requests and routes decisions to waiters.
#[derive(Default)]
pub struct ApprovalManager {
    pending: Mutex<HashMap<String, PendingEntry>>,
}

impl std::fmt::Debug for ApprovalManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApprovalManager")
            .field("pending", &self.pending.lock().len())
            .finish()
    }
}

impl ApprovalManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an approval record. An explicit non-empty id is honored,
    /// otherwise a fresh UUID is assigned.
    pub fn create_record(
        &self,
        request: ApprovalRequest,
        timeout_ms: u64,
        id: Option<&str>,
    ) -> ApprovalRecord {
        let now = now_ms();
        let id = id
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        ApprovalRecord {
            id,
            request,
            created_at_ms: now,
            expires_at_ms: now + timeout_ms,
            resolved_at_ms: None,
            decision: None,
            resolved_by: None,
        }
    }

    /// Register a record and wait for its decision.
    ///
    /// Returns `None` when the timeout elapses without a decision.
    pub async fn wait_for_decision(
        &self,
        record: ApprovalRecord,
        timeout_ms: u64,
    ) -> Option<ExecApprovalDecision> {
        let (tx, rx) = oneshot::channel();
        let id = record.id.clone();
        {
            let mut pending = self.pending.lock();
            pending.insert(
                id.clone(),
                PendingEntry {
                    record,
                    responder: tx,
                    expires_at: Instant::now() + Duration::from_millis(timeout_ms),
                },
            );
        }

        let result = tokio::time::timeout(Duration::from_millis(timeout_ms), rx).await;

        // Drop the entry if it is still registered (timeout path).
        self.pending.lock().remove(&id);

        match result {
            Ok(Ok(decision)) => decision,
            _ => None,
        }
    }

    /// Resolve a pending request. Returns `false` for unknown ids.
    pub fn resolve(
        &self,
        id: &str,
        decision: ExecApprovalDecision,
        resolved_by: Option<&str>,
    ) -> bool {
        let Some(mut entry) = self.pending.lock().remove(id) else {
            return false;
        };
        entry.record.resolved_at_ms = Some(now_ms());
        entry.record.decision = Some(decision);
        entry.record.resolved_by = resolved_by.map(|s| s.to_string());
        let _ = entry.responder.send(Some(decision));
        true
    }

    /// Snapshot a pending record by id.
    pub fn get_snapshot(&self, id: &str) -> Option<ApprovalRecord> {
        self.pending.lock().get(id).map(|e| e.record.clone())
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.pending.lock().contains_key(id)
    }

    /// All currently pending records.
    pub fn list_pending(&self) -> Vec<ApprovalRecord> {
        self.pending.lock().values().map(|e| e.record.clone()).collect()
    }

    /// Drop expired entries, signalling timeout to their waiters.
    pub fn cleanup_expired(&self) {
        let now = Instant::now();
        let mut pending = self.pending.lock();
        let expired: Vec<String> = pending
            .iter()
            .filter(|(_, entry)| entry.expires_at < now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            if let Some(entry) = pending.remove(&id) {
                let _ = entry.responder.send(None);
            }
        }
    }
}
