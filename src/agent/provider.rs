//! LLM provider trait and common types.
//!
//! Providers are external collaborators: the gateway only needs
//! `complete(request) -> stream of events`. Concrete Anthropic/OpenAI
//! clients live behind this trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::agent::AgentError;

/// A streaming event from the LLM.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Incremental text output.
    TextDelta { text: String },

    /// The model wants to call a tool.
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },

    /// The model finished its turn.
    Stop { reason: StopReason },

    /// Unrecoverable error from the provider.
    Error { message: String },
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
}

/// A request to the LLM.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<LlmMessage>,
    pub system: Option<String>,
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: u32,
}

/// A message in the LLM conversation.
#[derive(Debug, Clone)]
pub struct LlmMessage {
    pub role: LlmRole,
    pub content: Vec<ContentBlock>,
}

impl LlmMessage {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: LlmRole::User,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    pub fn assistant(content: Vec<ContentBlock>) -> Self {
        Self {
            role: LlmRole::Assistant,
            content,
        }
    }
}

/// Role of a message in the LLM conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmRole {
    User,
    Assistant,
}

/// A content block within a message.
#[derive(Debug, Clone)]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
}

/// A tool definition for the LLM.
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Trait for LLM providers (Anthropic, OpenAI, ...).
///
/// Implementations send a completion request and return a channel that
/// yields streaming events until the model stops or errors.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<mpsc::Receiver<StreamEvent>, AgentError>;
}

/// Maximum attempts for an upstream provider call.
pub const MAX_PROVIDER_ATTEMPTS: u32 = 3;

/// Call `complete` with jittered exponential backoff.
///
/// The completion call itself is idempotent (no state changes before a
/// stream is returned), so transient upstream errors retry up to
/// [`MAX_PROVIDER_ATTEMPTS`] times.
pub async fn complete_with_retry(
    provider: &dyn LlmProvider,
    request: CompletionRequest,
) -> Result<mpsc::Receiver<StreamEvent>, AgentError> {
    let mut last_err = AgentError::NoProvider;
    for attempt in 0..MAX_PROVIDER_ATTEMPTS {
        match provider.complete(request.clone()).await {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                last_err = err;
                if attempt + 1 < MAX_PROVIDER_ATTEMPTS {
                    let backoff = backoff_with_jitter(attempt);
                    tracing::warn!(
                        target: "gateway",
                        attempt = attempt + 1,
                        delay_ms = backoff.as_millis() as u64,
                        error = %last_err,
                        "provider call failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
    Err(last_err)
}

/// Exponential base delay (250ms, 500ms, 1s, ...) plus up to 50% jitter.
fn backoff_with_jitter(attempt: u32) -> Duration {
    let base_ms = 250u64 << attempt.min(4);
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0);
    let jitter = nanos % (base_ms / 2 + 1);
    Duration::from_millis(base_ms + jitter)
}
