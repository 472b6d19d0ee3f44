use crate::errors::MeaoError;
use crate::providers::base::{
    ChatRequest, Message, ModelProvider, ModelResponse, ProviderMetrics, StopReason, StreamEvent,
    StreamHandler, ToolDefinition,
};
use crate::providers::errors::ProviderErrorHandler;
use crate::providers::sse::parse_sse_chunk;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::warn;

const API_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";
const CONNECT_TIMEOUT_SECS: u64 = 30;
const STREAM_CHUNK_TIMEOUT_SECS: u64 = 120;

pub struct AnthropicProvider {
    api_key: String,
    default_model: String,
    base_url: String,
    request_timeout: Duration,
    client: Client,
    metrics: Arc<Mutex<ProviderMetrics>>,
}

impl AnthropicProvider {
    pub fn new(api_key: String, default_model: Option<String>) -> Self {
        Self::with_base_url(api_key, default_model, API_URL.to_string())
    }

    pub fn with_base_url(
        api_key: String,
        default_model: Option<String>,
        base_url: String,
    ) -> Self {
        Self {
            api_key,
            default_model: default_model
                .unwrap_or_else(|| "claude-sonnet-4-5-20250929".to_string()),
            base_url,
            request_timeout: Duration::from_secs(STREAM_CHUNK_TIMEOUT_SECS),
            client: Client::builder()
                .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
                .build()
                .unwrap_or_else(|_| Client::new()),
            metrics: Arc::new(Mutex::new(ProviderMetrics::default())),
        }
    }

    fn build_payload(&self, req: &ChatRequest<'_>, stream: bool) -> Value {
        let (system, messages) = convert_messages(&req.messages);

        let mut payload = json!({
            "model": req.model.unwrap_or(&self.default_model),
            "messages": messages,
            "max_tokens": req.max_tokens,
            "temperature": req.temperature,
        });
        if stream {
            payload["stream"] = json!(true);
        }
        if let Some(system) = system {
            payload["system"] = json!(system);
        }
        if !req.tools.is_empty() {
            payload["tools"] = json!(convert_tools(&req.tools));
        }
        payload
    }

    fn bump_tokens(&self, tokens: u64) {
        if let Ok(mut metrics) = self.metrics.lock() {
            metrics.token_count += tokens;
        }
    }
}

#[async_trait]
impl ModelProvider for AnthropicProvider {
    async fn create_message_stream(
        &self,
        req: ChatRequest<'_>,
        on_event: &StreamHandler<'_>,
    ) -> Result<ModelResponse, MeaoError> {
        let payload = self.build_payload(&req, true);

        let resp = self
            .client
            .post(&self.base_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&payload)
            .send()
            .await
            .map_err(|e| ProviderErrorHandler::network_error(&e, "Anthropic"))?;

        let resp = ProviderErrorHandler::check_http_status(resp, "Anthropic").await?;

        let mut response = ModelResponse::default();
        let mut content_text = String::new();
        // index → tool_use id, for routing input_json deltas
        let mut tool_blocks: HashMap<u64, String> = HashMap::new();
        let mut buf = String::new();

        let mut stream = resp.bytes_stream();
        loop {
            let chunk = match tokio::time::timeout(self.request_timeout, stream.next()).await {
                Ok(chunk) => chunk,
                Err(_) => {
                    warn!("Anthropic stream timed out waiting for next chunk");
                    break;
                }
            };
            let Some(chunk) = chunk else { break };
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    warn!("error reading Anthropic stream chunk: {}", e);
                    break;
                }
            };
            buf.push_str(&String::from_utf8_lossy(&chunk));

            // Process complete SSE events; keep the trailing partial event
            let consumable = match buf.rfind("\n\n") {
                Some(pos) => {
                    let complete = buf[..pos + 2].to_string();
                    buf = buf[pos + 2..].to_string();
                    complete
                }
                None => continue,
            };

            for event in parse_sse_chunk(&consumable) {
                let Some(data) = event.data else { continue };
                match data["type"].as_str().unwrap_or("") {
                    "message_start" => {
                        let input_tokens = data["message"]["usage"]["input_tokens"]
                            .as_u64()
                            .unwrap_or(0);
                        response.input_tokens = input_tokens;
                        self.bump_tokens(input_tokens);
                        on_event(StreamEvent::MessageStart { input_tokens });
                    }
                    "content_block_start" => {
                        let block = &data["content_block"];
                        if block["type"].as_str() == Some("tool_use") {
                            let index = data["index"].as_u64().unwrap_or(0);
                            let id = block["id"].as_str().unwrap_or("").to_string();
                            let name = block["name"].as_str().unwrap_or("").to_string();
                            tool_blocks.insert(index, id.clone());
                            on_event(StreamEvent::ToolUseStart { id, name });
                        }
                    }
                    "content_block_delta" => {
                        let delta = &data["delta"];
                        match delta["type"].as_str() {
                            Some("text_delta") => {
                                if let Some(text) = delta["text"].as_str() {
                                    content_text.push_str(text);
                                    on_event(StreamEvent::TextDelta {
                                        text: text.to_string(),
                                    });
                                }
                            }
                            Some("input_json_delta") => {
                                let index = data["index"].as_u64().unwrap_or(0);
                                if let Some(partial) = delta["partial_json"].as_str() {
                                    if let Some(id) = tool_blocks.get(&index) {
                                        on_event(StreamEvent::InputJsonDelta {
                                            id: id.clone(),
                                            partial_json: partial.to_string(),
                                        });
                                    }
                                }
                            }
                            _ => {}
                        }
                    }
                    "content_block_stop" => {
                        let index = data["index"].as_u64().unwrap_or(0);
                        on_event(StreamEvent::ContentBlockStop {
                            tool_call_id: tool_blocks.get(&index).cloned(),
                        });
                    }
                    "message_delta" => {
                        let stop_reason = data["delta"]["stop_reason"]
                            .as_str()
                            .and_then(StopReason::parse);
                        if stop_reason.is_some() {
                            response.stop_reason = stop_reason;
                        }
                        let output_tokens = data["usage"]["output_tokens"].as_u64().unwrap_or(0);
                        response.output_tokens = output_tokens;
                        self.bump_tokens(output_tokens);
                        on_event(StreamEvent::MessageDelta {
                            stop_reason,
                            output_tokens,
                        });
                    }
                    "message_stop" => {
                        response.completed = true;
                        on_event(StreamEvent::MessageStop);
                    }
                    _ => {}
                }
            }

            if response.completed {
                break;
            }
        }

        if let Ok(mut metrics) = self.metrics.lock() {
            metrics.request_count += 1;
            if !response.completed {
                metrics.error_count += 1;
            }
        }

        response.content = if content_text.is_empty() {
            None
        } else {
            Some(content_text)
        };
        Ok(response)
    }

    async fn create_message(&self, req: ChatRequest<'_>) -> Result<ModelResponse, MeaoError> {
        let payload = self.build_payload(&req, false);

        let resp = self
            .client
            .post(&self.base_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&payload)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| ProviderErrorHandler::network_error(&e, "Anthropic"))?;

        let json = ProviderErrorHandler::check_response(resp, "Anthropic").await?;

        let mut content = String::new();
        if let Some(blocks) = json["content"].as_array() {
            for block in blocks {
                if block["type"].as_str() == Some("text") {
                    content.push_str(block["text"].as_str().unwrap_or(""));
                }
            }
        }
        let input_tokens = json["usage"]["input_tokens"].as_u64().unwrap_or(0);
        let output_tokens = json["usage"]["output_tokens"].as_u64().unwrap_or(0);
        self.bump_tokens(input_tokens + output_tokens);
        if let Ok(mut metrics) = self.metrics.lock() {
            metrics.request_count += 1;
        }

        Ok(ModelResponse {
            content: if content.is_empty() {
                None
            } else {
                Some(content)
            },
            stop_reason: json["stop_reason"].as_str().and_then(StopReason::parse),
            input_tokens,
            output_tokens,
            completed: true,
        })
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    fn metrics(&self) -> ProviderMetrics {
        self.metrics
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default()
    }
}

/// Convert provider-neutral messages to the Anthropic wire format.
/// System messages collapse into the top-level `system` string; tool results
/// become `tool_result` blocks on user messages, merging consecutive results
/// into one message as the API requires.
fn convert_messages(messages: &[Message]) -> (Option<String>, Vec<Value>) {
    let mut system_parts: Vec<&str> = Vec::new();
    let mut out: Vec<Value> = Vec::new();

    for msg in messages {
        match msg.role.as_str() {
            "system" => system_parts.push(&msg.content),
            "assistant" => {
                let mut blocks: Vec<Value> = Vec::new();
                if !msg.content.is_empty() {
                    blocks.push(json!({"type": "text", "text": msg.content}));
                }
                for tc in &msg.tool_calls {
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": tc.id,
                        "name": tc.name,
                        "input": tc.arguments,
                    }));
                }
                out.push(json!({"role": "assistant", "content": blocks}));
            }
            "tool" => {
                let block = json!({
                    "type": "tool_result",
                    "tool_use_id": msg.tool_call_id.clone().unwrap_or_default(),
                    "content": msg.content,
                    "is_error": msg.is_error,
                });
                // Merge into the preceding user message when it already
                // carries tool results
                let mut merged = false;
                if let Some(last) = out.last_mut() {
                    if last["role"] == "user" {
                        if let Some(blocks) = last["content"].as_array_mut() {
                            if blocks.iter().any(|b| b["type"] == "tool_result") {
                                blocks.push(block.clone());
                                merged = true;
                            }
                        }
                    }
                }
                if !merged {
                    out.push(json!({"role": "user", "content": [block]}));
                }
            }
            _ => {
                out.push(json!({
                    "role": "user",
                    "content": [{"type": "text", "text": msg.content}],
                }));
            }
        }
    }

    let system = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n\n"))
    };
    (system, out)
}

fn convert_tools(tools: &[ToolDefinition]) -> Vec<Value> {
    tools
        .iter()
        .map(|t| {
            json!({
                "name": t.name,
                "description": t.description,
                "input_schema": t.parameters,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests;
