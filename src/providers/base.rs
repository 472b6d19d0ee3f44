use crate::errors::MeaoError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// One conversation message in provider-neutral form.
#[derive(Debug, Clone, Default)]
pub struct Message {
    pub role: String,
    pub content: String,
    /// Tool calls issued by an assistant message.
    pub tool_calls: Vec<ToolCallRef>,
    /// Set for role="tool" result messages.
    pub tool_call_id: Option<String>,
    pub is_error: bool,
}

/// Reference to an already-assembled tool call, carried on assistant
/// messages so the provider can replay the conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRef {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCallRef>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
            tool_calls,
            ..Default::default()
        }
    }

    pub fn tool_result(
        tool_call_id: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self {
            role: "tool".into(),
            content: content.into(),
            tool_call_id: Some(tool_call_id.into()),
            is_error,
            ..Default::default()
        }
    }
}

/// Tool schema passed to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value, // JSON Schema
}

/// Why the model stopped emitting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
}

impl StopReason {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "end_turn" => Some(Self::EndTurn),
            "tool_use" => Some(Self::ToolUse),
            "max_tokens" => Some(Self::MaxTokens),
            "stop_sequence" => Some(Self::StopSequence),
            _ => None,
        }
    }
}

/// Typed events yielded while a response streams.
///
/// The orchestrator forwards text deltas to the channel and feeds tool-use
/// events into the assembler; the provider never assembles tool calls
/// itself.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    MessageStart {
        input_tokens: u64,
    },
    TextDelta {
        text: String,
    },
    ToolUseStart {
        id: String,
        name: String,
    },
    InputJsonDelta {
        id: String,
        partial_json: String,
    },
    ContentBlockStop {
        /// Set for tool_use blocks; `None` for text blocks.
        tool_call_id: Option<String>,
    },
    MessageDelta {
        stop_reason: Option<StopReason>,
        output_tokens: u64,
    },
    MessageStop,
}

/// Synchronous event sink fed from the stream loop, in order.
pub type StreamHandler<'a> = dyn Fn(StreamEvent) + Send + Sync + 'a;

/// Final accounting for one model response.
#[derive(Debug, Clone, Default)]
pub struct ModelResponse {
    pub content: Option<String>,
    pub stop_reason: Option<StopReason>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Whether `message_stop` was observed. A false value means the stream
    /// disconnected and any in-flight tool call must be discarded.
    pub completed: bool,
}

/// Metrics for provider operations.
#[derive(Debug, Clone, Default)]
pub struct ProviderMetrics {
    pub request_count: u64,
    pub token_count: u64,
    pub error_count: u64,
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 10000,
            backoff_multiplier: 2.0,
        }
    }
}

/// Parameters for one model request.
#[derive(Debug, Clone)]
pub struct ChatRequest<'a> {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub model: Option<&'a str>,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Stream one response, invoking `on_event` for each event in order.
    ///
    /// Errors are returned only for failures before the stream starts
    /// (connection, HTTP status); a mid-stream disconnect yields
    /// `Ok(response)` with `completed == false`.
    async fn create_message_stream(
        &self,
        req: ChatRequest<'_>,
        on_event: &StreamHandler<'_>,
    ) -> Result<ModelResponse, MeaoError>;

    /// One-shot variant. The default implementation drains a stream while
    /// ignoring events.
    async fn create_message(&self, req: ChatRequest<'_>) -> Result<ModelResponse, MeaoError> {
        self.create_message_stream(req, &|_event| {}).await
    }

    fn default_model(&self) -> &str;

    /// Pre-warm the provider's HTTP connection (TLS handshake, HTTP/2
    /// negotiation). Default is a no-op.
    async fn warmup(&self) -> Result<(), MeaoError> {
        Ok(())
    }

    /// Accumulated provider metrics. Default returns zeroed metrics.
    fn metrics(&self) -> ProviderMetrics {
        ProviderMetrics::default()
    }

    /// Stream with automatic retry on transient errors.
    ///
    /// Only pre-stream failures are retried (those are the only `Err`
    /// returns); rate limits honor the retry-after hint, other transient
    /// errors back off exponentially with jitter.
    async fn stream_with_retry(
        &self,
        req: ChatRequest<'_>,
        on_event: &StreamHandler<'_>,
        retry_config: Option<RetryConfig>,
    ) -> Result<ModelResponse, MeaoError> {
        let config = retry_config.unwrap_or_default();
        let mut last_error: Option<MeaoError> = None;

        for attempt in 0..=config.max_retries {
            if attempt > 0 {
                warn!(
                    "provider retry attempt {}/{} after: {}",
                    attempt,
                    config.max_retries,
                    last_error
                        .as_ref()
                        .map(ToString::to_string)
                        .unwrap_or_default()
                );
            }
            let chat_req = ChatRequest {
                messages: req.messages.clone(),
                tools: req.tools.clone(),
                model: req.model,
                max_tokens: req.max_tokens,
                temperature: req.temperature,
            };
            match self.create_message_stream(chat_req, on_event).await {
                Ok(response) => {
                    debug!("model request succeeded on attempt {}", attempt);
                    return Ok(response);
                }
                Err(e) => {
                    if !e.is_retryable() {
                        return Err(e);
                    }
                    let retry_after = match &e {
                        MeaoError::RateLimit { retry_after } => *retry_after,
                        _ => None,
                    };
                    warn!("model request failed on attempt {}: {}", attempt, e);
                    last_error = Some(e);
                    if attempt < config.max_retries {
                        let delay_ms = if let Some(secs) = retry_after {
                            debug!("honoring retry-after hint: {}s", secs);
                            secs * 1000
                        } else {
                            let base = (config.initial_delay_ms as f64
                                * config.backoff_multiplier.powi(attempt as i32))
                            .min(config.max_delay_ms as f64)
                                as u64;
                            // Jitter (up to 25%) avoids thundering herd
                            base + (base as f64 * 0.25 * fastrand::f64()) as u64
                        };
                        tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| MeaoError::Provider {
            message: "all retry attempts failed".to_string(),
            retryable: false,
        }))
    }
}
