//! Out-of-band approval socket.
//!
//! Newline-delimited JSON over a local Unix socket. A responder process
//! (approval UI, CLI prompt) listens on the socket path recorded in the
//! approvals file; the exec engine connects, writes one request line, and
//! waits for the matching decision line. The shared token from the approvals
//! file authenticates requesters; a mismatched token drops the connection.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use super::manager::ApprovalRequest;
use super::ExecApprovalDecision;

/// Maximum accepted line length (1 MB), preventing memory exhaustion from a
/// misbehaving peer.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Request line sent by the exec engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub token: String,
    pub id: String,
    pub request: ApprovalRequest,
}

/// Decision line sent back by the responder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketDecision {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    pub decision: ExecApprovalDecision,
}

#[cfg(unix)]
mod unix_impl {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{UnixListener, UnixStream};
    use tracing::{debug, info, warn};

    /// Connect to the responder socket, send one request, and wait for the
    /// matching decision.
    ///
    /// Any failure (socket missing, nobody listening, malformed reply,
    /// timeout) yields `None`; the caller applies its `askFallback`.
    pub async fn request_decision(
        socket_path: &Path,
        token: &str,
        id: &str,
        request: &ApprovalRequest,
        timeout_ms: u64,
    ) -> Option<ExecApprovalDecision> {
        let attempt = async {
            let stream = UnixStream::connect(socket_path).await.ok()?;
            let (reader, mut writer) = stream.into_split();

            let line = SocketRequest {
                kind: "request".to_string(),
                token: token.to_string(),
                id: id.to_string(),
                request: request.clone(),
            };
            let mut payload = serde_json::to_string(&line).ok()?;
            payload.push('\n');
            writer.write_all(payload.as_bytes()).await.ok()?;
            writer.flush().await.ok()?;

            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.len() > MAX_LINE_BYTES {
                    return None;
                }
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let Ok(decision) = serde_json::from_str::<SocketDecision>(trimmed) else {
                    continue;
                };
                if decision.kind == "decision" && decision.id == id {
                    return Some(decision.decision);
                }
            }
            None
        };

        match tokio::time::timeout(Duration::from_millis(timeout_ms), attempt).await {
            Ok(decision) => decision,
            Err(_) => {
                debug!(target: "approvals", id, "approval socket request timed out");
                None
            }
        }
    }

    /// Responder side of the socket: listens, authenticates request lines,
    /// and answers with the decision produced by `decide`.
    ///
    /// This is the piece an approval UI embeds; the gateway only uses it in
    /// tests and the CLI prompt surface.
    pub async fn serve_responder<F>(
        socket_path: &Path,
        token: String,
        decide: F,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> Result<(), String>
    where
        F: Fn(ApprovalRequest) -> ExecApprovalDecision + Send + Sync + Clone + 'static,
    {
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("failed to create socket dir: {e}"))?;
        }
        match std::fs::remove_file(socket_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(format!("failed to remove stale socket: {e}")),
        }

        let listener = UnixListener::bind(socket_path)
            .map_err(|e| format!("failed to bind {}: {e}", socket_path.display()))?;
        info!(target: "approvals", path = %socket_path.display(), "approval responder listening");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            let token = token.clone();
                            let decide = decide.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_requester(stream, &token, decide).await {
                                    debug!(target: "approvals", "responder connection ended: {e}");
                                }
                            });
                        }
                        Err(e) => warn!(target: "approvals", "accept error: {e}"),
                    }
                }
                _ = shutdown.wait_for(|&v| v) => break,
            }
        }

        let _ = std::fs::remove_file(socket_path);
        Ok(())
    }

    async fn handle_requester<F>(
        stream: UnixStream,
        token: &str,
        decide: F,
    ) -> Result<(), String>
    where
        F: Fn(ApprovalRequest) -> ExecApprovalDecision,
    {
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        while let Some(line) = lines.next_line().await.map_err(|e| e.to_string())? {
            if line.len() > MAX_LINE_BYTES {
                return Err("oversized request line".into());
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let request: SocketRequest = match serde_json::from_str(trimmed) {
                Ok(req) => req,
                Err(e) => return Err(format!("invalid request line: {e}")),
            };
            if request.kind != "request" {
                continue;
            }
            if !crate::auth::timing_safe_eq(&request.token, token) {
                // Wrong token: drop the connection without a reply.
                return Err("token mismatch".into());
            }

            let decision = SocketDecision {
                kind: "decision".to_string(),
                id: request.id,
                decision: decide(request.request),
            };
            let mut payload =
                serde_json::to_string(&decision).map_err(|e| e.to_string())?;
            payload.push('\n');
            writer
                .write_all(payload.as_bytes())
                .await
                .map_err(|e| e.to_string())?;
            writer.flush().await.map_err(|e| e.to_string())?;
        }
        Ok(())
    }
}

#[cfg(unix)]
pub use unix_impl::{request_decision, serve_responder};

/// Non-Unix hosts have no approval socket; callers fall back per policy.
#[cfg(not(unix))]
pub async fn request_decision(
    _socket_path: &Path,
    _token: &str,
    _id: &str,
    _request: &ApprovalRequest,
    _timeout_ms: u64,
) -> Option<ExecApprovalDecision> {
    tracing::warn!(target: "approvals", "approval socket unsupported on this platform");
    None
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn request(command: &str) -> ApprovalRequest {
        ApprovalRequest {
            command: command.to_string(),
            agent_id: Some("main".to_string()),
            ..Default::default()
        }
    }

    async fn spawn_responder(
        path: &Path,
        token: &str,
        decision: ExecApprovalDecision,
    ) -> tokio::sync::watch::Sender<bool> {
        let (tx, rx) = tokio::sync::watch::channel(false);
        let path = path.to_path_buf();
        let token = token.to_string();
        tokio::spawn(async move {
            let _ = serve_responder(&path, token, move |_req| decision, rx).await;
        });
        // Give the listener a moment to bind.
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx
    }

    #[tokio::test]
    async fn test_round_trip_decision() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("approvals.sock");
        let shutdown =
            spawn_responder(&path, "tok", ExecApprovalDecision::AllowOnce).await;

        let decision =
            request_decision(&path, "tok", "req-1", &request("uname -a"), 2_000).await;
        assert_eq!(decision, Some(ExecApprovalDecision::AllowOnce));
        let _ = shutdown.send(true);
    }

    #[tokio::test]
    async fn test_token_mismatch_drops_connection() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("approvals.sock");
        let shutdown =
            spawn_responder(&path, "right-token", ExecApprovalDecision::AllowOnce).await;

        let decision =
            request_decision(&path, "wrong-token", "req-2", &request("ls"), 500).await;
        assert_eq!(decision, None);
        let _ = shutdown.send(true);
    }

    #[tokio::test]
    async fn test_no_responder_times_out_to_none() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing.sock");
        let decision = request_decision(&path, "tok", "req-3", &request("ls"), 200).await;
        assert_eq!(decision, None);
    }

    #[tokio::test]
    async fn test_deny_decision_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("approvals.sock");
        let shutdown = spawn_responder(&path, "tok", ExecApprovalDecision::Deny).await;

        let decision =
            request_decision(&path, "tok", "req-4", &request("rm -rf /"), 2_000).await;
        assert_eq!(decision, Some(ExecApprovalDecision::Deny));
        let _ = shutdown.send(true);
    }
}
