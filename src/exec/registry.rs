//! Registry of live and recently-exited exec sessions.
//!
//! Backgrounded sessions outlive their invoking tool call; the `process`
//! tool reaps them through this registry. Each session's state is behind its
//! own mutex, written only by the owning lifecycle task.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::{CancelSource, ExecSessionState};

/// Shared handle to one exec session.
#[derive(Clone)]
pub struct ExecSessionHandle {
    pub state: Arc<Mutex<ExecSessionState>>,
    kill_tx: mpsc::UnboundedSender<CancelSource>,
}

impl std::fmt::Debug for ExecSessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecSessionHandle")
            .field("id", &self.state.lock().id)
            .finish()
    }
}

impl ExecSessionHandle {
    pub fn new(
        state: Arc<Mutex<ExecSessionState>>,
        kill_tx: mpsc::UnboundedSender<CancelSource>,
    ) -> Self {
        Self { state, kill_tx }
    }

    /// Request a kill. The lifecycle task applies the backgrounding rule:
    /// a `Signal` cancellation is ignored once the session backgrounded;
    /// `Timeout` and `Operator` always kill.
    pub fn cancel(&self, source: CancelSource) {
        let _ = self.kill_tx.send(source);
    }

    pub fn snapshot(&self) -> ExecSessionState {
        self.state.lock().clone()
    }
}

/// Process-wide exec session registry.
#[derive(Default)]
pub struct ExecSessionRegistry {
    sessions: Mutex<HashMap<String, ExecSessionHandle>>,
}

impl std::fmt::Debug for ExecSessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecSessionRegistry")
            .field("sessions", &self.sessions.lock().len())
            .finish()
    }
}

impl ExecSessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, handle: ExecSessionHandle) {
        let id = handle.state.lock().id.clone();
        self.sessions.lock().insert(id, handle);
    }

    pub fn get(&self, id: &str) -> Option<ExecSessionHandle> {
        self.sessions.lock().get(id).cloned()
    }

    /// Find by full id or unique short-id prefix.
    pub fn find(&self, id_or_prefix: &str) -> Option<ExecSessionHandle> {
        let sessions = self.sessions.lock();
        if let Some(handle) = sessions.get(id_or_prefix) {
            return Some(handle.clone());
        }
        let mut matches = sessions
            .iter()
            .filter(|(id, _)| id.starts_with(id_or_prefix));
        let first = matches.next()?;
        if matches.next().is_some() {
            return None;
        }
        Some(first.1.clone())
    }

    /// Snapshots of every tracked session.
    pub fn list(&self) -> Vec<ExecSessionState> {
        self.sessions
            .lock()
            .values()
            .map(|handle| handle.state.lock().clone())
            .collect()
    }

    /// Kill a session. Returns `false` for unknown ids.
    pub fn kill(&self, id: &str, source: CancelSource) -> bool {
        match self.get(id) {
            Some(handle) => {
                handle.cancel(source);
                true
            }
            None => false,
        }
    }

    /// Drain a session's pending output (process-tool poll). Exited
    /// sessions are removed once drained.
    pub fn poll(&self, id: &str) -> Option<(ExecSessionState, String, String)> {
        let handle = self.get(id)?;
        let (snapshot, out, err) = {
            let mut state = handle.state.lock();
            let (out, err) = state.take_pending();
            (state.clone(), out, err)
        };
        if snapshot.exited {
            self.sessions.lock().remove(id);
        }
        Some((snapshot, out, err))
    }

    pub fn remove(&self, id: &str) -> Option<ExecSessionHandle> {
        self.sessions.lock().remove(id)
    }
}
