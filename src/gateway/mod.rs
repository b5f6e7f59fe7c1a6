//! Gateway wire protocol: frame envelopes and the push/event mapping.
//!
//! Every frame on the hub WebSocket plane is a single JSON object carrying a
//! `type` discriminator. Payloads stay as `serde_json::Value` so map-of-map
//! and list-of-any round-trip byte-identical, and unknown top-level keys are
//! preserved on pass-through via flattened maps.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Current gateway protocol version.
pub const PROTOCOL_VERSION: u32 = 2;

/// Maximum serialized frame size. Oversize frames close the socket.
pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// Maximum JSON nesting depth accepted in a frame.
pub const MAX_JSON_DEPTH: usize = 32;

/// Close reason used when a frame exceeds [`MAX_FRAME_BYTES`].
pub const FRAME_TOO_LARGE_REASON: &str = "frame-too-large";

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame-too-large: {size} bytes exceeds {max}")]
    TooLarge { size: usize, max: usize },

    #[error("JSON nesting depth exceeds maximum allowed depth of {max}")]
    TooDeep { max: usize },

    #[error("invalid frame: {0}")]
    Parse(String),

    #[error("failed to serialize frame: {0}")]
    Serialize(String),
}

/// Reject over-nested JSON before the parser sees it.
///
/// Scans the raw text counting `{`/`[` nesting, skipping string contents
/// (including escaped quotes), so a maliciously deep frame is refused
/// without ever recursing into it.
pub fn validate_json_depth(text: &str, max_depth: usize) -> Result<(), FrameError> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for byte in text.bytes() {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' | b'[' => {
                depth += 1;
                if depth > max_depth {
                    return Err(FrameError::TooDeep { max: max_depth });
                }
            }
            b'}' | b']' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    Ok(())
}

/// A frame envelope on the hub plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Client handshake (first client frame on a connection).
    #[serde(rename = "hello")]
    Hello(HelloFrame),

    /// RPC request (client → server; nodes also use it for invoke results).
    #[serde(rename = "rpc.req")]
    RpcReq(RpcReqFrame),

    /// RPC response (server → client).
    #[serde(rename = "rpc.res")]
    RpcRes(RpcResFrame),

    /// Server-pushed event, ordered by `seq` per connection.
    #[serde(rename = "event")]
    Event(EventFrame),

    /// Full state snapshot (the HelloOk block re-pushed).
    #[serde(rename = "push.snapshot")]
    PushSnapshot(PushSnapshotFrame),

    /// Gap report from a client that observed a `seq` discontinuity.
    #[serde(rename = "seqGap")]
    SeqGap(SeqGapFrame),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloFrame {
    pub role: String,
    pub client_name: String,
    pub client_version: String,
    pub platform: String,
    pub mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Commands declared by node peers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commands: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcReqFrame {
    pub id: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResFrame {
    pub id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Error block carried by a failed `rpc.res`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(
        default,
        rename = "stateVersion",
        skip_serializing_if = "Option::is_none"
    )]
    pub state_version: Option<StateVersion>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The full HelloOk block minus the `type` discriminator, kept untyped so
/// every snapshot field passes through unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushSnapshotFrame {
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeqGapFrame {
    pub expected: u64,
    pub received: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Monotonic version counters for the presence and health sub-states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StateVersion {
    pub presence: u64,
    pub health: u64,
}

/// The HelloOk payload sent in reply to a client `hello`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloOk {
    #[serde(rename = "type")]
    pub payload_type: &'static str,
    #[serde(rename = "_protocol")]
    pub protocol: u32,
    pub server: Map<String, Value>,
    pub features: Map<String, Value>,
    pub snapshot: Snapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canvas_host_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<Value>,
    pub policy: PolicyInfo,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub presence: Vec<Value>,
    pub health: Value,
    pub state_version: StateVersion,
    pub uptime_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_defaults: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyInfo {
    pub max_payload: usize,
    pub tick_interval_ms: u64,
}

/// Decode one frame from wire text. Enforces [`MAX_FRAME_BYTES`] and
/// [`MAX_JSON_DEPTH`] before parsing.
pub fn decode_frame(text: &str) -> Result<Frame, FrameError> {
    if text.len() > MAX_FRAME_BYTES {
        return Err(FrameError::TooLarge {
            size: text.len(),
            max: MAX_FRAME_BYTES,
        });
    }
    validate_json_depth(text, MAX_JSON_DEPTH)?;
    serde_json::from_str(text).map_err(|e| FrameError::Parse(e.to_string()))
}

/// Encode a frame to wire text. Enforces [`MAX_FRAME_BYTES`].
pub fn encode_frame(frame: &Frame) -> Result<String, FrameError> {
    let text = serde_json::to_string(frame).map_err(|e| FrameError::Serialize(e.to_string()))?;
    if text.len() > MAX_FRAME_BYTES {
        return Err(FrameError::TooLarge {
            size: text.len(),
            max: MAX_FRAME_BYTES,
        });
    }
    Ok(text)
}

// ---------------------------------------------------------------------------
// Push → transport event mapping
// ---------------------------------------------------------------------------

/// Chat turn state carried by `chat` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatState {
    Streaming,
    Tool,
    Final,
}

impl ChatState {
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "streaming" => Some(Self::Streaming),
            "tool" => Some(Self::Tool),
            "final" => Some(Self::Final),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Streaming => "streaming",
            Self::Tool => "tool",
            Self::Final => "final",
        }
    }
}

/// Transport-level event extracted from an inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    Health { ok: bool },
    Tick,
    Chat {
        run_id: String,
        session_key: String,
        state: ChatState,
    },
    SeqGap { expected: u64, received: u64 },
}

/// Map a frame to a transport event.
///
/// Unknown `event:` frames map to `None` and are dropped.
pub fn map_frame(frame: &Frame) -> Option<GatewayEvent> {
    match frame {
        Frame::PushSnapshot(snapshot) => {
            let ok = snapshot
                .body
                .get("snapshot")
                .and_then(|s| s.get("health"))
                .and_then(|h| h.get("ok"))
                .and_then(|v| v.as_bool())?;
            Some(GatewayEvent::Health { ok })
        }
        Frame::Event(event) => match event.event.as_str() {
            "health" => {
                let ok = event
                    .payload
                    .as_ref()
                    .and_then(|p| p.get("ok"))
                    .and_then(|v| v.as_bool())?;
                Some(GatewayEvent::Health { ok })
            }
            "tick" => Some(GatewayEvent::Tick),
            "chat" => {
                let payload = event.payload.as_ref()?;
                let run_id = payload.get("runId").and_then(|v| v.as_str())?;
                let session_key = payload.get("sessionKey").and_then(|v| v.as_str())?;
                let state = payload
                    .get("state")
                    .and_then(|v| v.as_str())
                    .and_then(ChatState::from_str_opt)?;
                Some(GatewayEvent::Chat {
                    run_id: run_id.to_string(),
                    session_key: session_key.to_string(),
                    state,
                })
            }
            _ => None,
        },
        Frame::SeqGap(gap) => Some(GatewayEvent::SeqGap {
            expected: gap.expected,
            received: gap.received,
        }),
        _ => None,
    }
}
