//! Reconstructs executable tool calls from streamed JSON fragments.
//!
//! A synchronous state machine fed by the provider's event stream: per call
//! id it buffers `input_json` deltas and validates the concatenation when the
//! block stops. No tool executes unless `end` returned a successfully parsed
//! call.

use serde_json::Value;
use tracing::{debug, warn};

/// A fully assembled, parse-validated tool call.
#[derive(Debug, Clone)]
pub struct AssembledToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// A call that could not be assembled.
#[derive(Debug, Clone)]
pub struct AssemblerError {
    pub id: String,
    pub reason: String,
    pub partial_json: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallState {
    Open,
    Complete,
    Failed,
}

#[derive(Debug)]
struct PartialCall {
    id: String,
    name: String,
    buffer: String,
    state: CallState,
}

/// Buffers streamed partial tool-call JSON per call id.
#[derive(Debug, Default)]
pub struct ToolCallAssembler {
    calls: Vec<PartialCall>,
}

impl ToolCallAssembler {
    pub fn new() -> Self {
        Self { calls: Vec::new() }
    }

    /// Open a new call buffer. A repeated id reopens the buffer (the stream
    /// is authoritative) with a warning.
    pub fn start(&mut self, id: &str, name: &str) {
        if let Some(existing) = self.calls.iter_mut().find(|c| c.id == id) {
            warn!("assembler: duplicate content block for call {}", id);
            existing.name = name.to_string();
            existing.buffer.clear();
            existing.state = CallState::Open;
            return;
        }
        self.calls.push(PartialCall {
            id: id.to_string(),
            name: name.to_string(),
            buffer: String::new(),
            state: CallState::Open,
        });
    }

    /// Append a JSON fragment. A delta for an unknown id opens an entry named
    /// `"unknown"` so the rest of the stream stays usable; such a call can
    /// never pass approval because no tool matches that name.
    pub fn add_delta(&mut self, id: &str, fragment: &str) {
        match self
            .calls
            .iter_mut()
            .find(|c| c.id == id && c.state == CallState::Open)
        {
            Some(call) => call.buffer.push_str(fragment),
            None => {
                warn!("assembler: delta for unknown call {}", id);
                self.calls.push(PartialCall {
                    id: id.to_string(),
                    name: "unknown".to_string(),
                    buffer: fragment.to_string(),
                    state: CallState::Open,
                });
            }
        }
    }

    /// Finish a call: parse the buffered JSON. An empty buffer parses as `{}`
    /// (a tool may take no arguments). Transitions: open → complete on
    /// success, open → failed on parse error; no other transitions.
    pub fn end(&mut self, id: &str) -> Result<AssembledToolCall, AssemblerError> {
        let Some(call) = self
            .calls
            .iter_mut()
            .find(|c| c.id == id && c.state == CallState::Open)
        else {
            return Err(AssemblerError {
                id: id.to_string(),
                reason: "no open call with this id".to_string(),
                partial_json: String::new(),
            });
        };

        let raw = if call.buffer.trim().is_empty() {
            "{}"
        } else {
            call.buffer.as_str()
        };
        match serde_json::from_str::<Value>(raw) {
            Ok(arguments) if arguments.is_object() => {
                call.state = CallState::Complete;
                debug!("assembler: completed call {} ({})", call.id, call.name);
                Ok(AssembledToolCall {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    arguments,
                })
            }
            Ok(other) => {
                call.state = CallState::Failed;
                Err(AssemblerError {
                    id: call.id.clone(),
                    reason: format!("tool input must be a JSON object, got {}", json_kind(&other)),
                    partial_json: call.buffer.clone(),
                })
            }
            Err(e) => {
                call.state = CallState::Failed;
                Err(AssemblerError {
                    id: call.id.clone(),
                    reason: format!("invalid JSON: {}", e),
                    partial_json: call.buffer.clone(),
                })
            }
        }
    }

    /// Convert every still-open call into a failure. Used when the stream
    /// disconnects before `message_stop`: in-flight calls are discarded, not
    /// executed.
    pub fn fail_incomplete(&mut self, reason: &str) -> Vec<AssemblerError> {
        let mut errors = Vec::new();
        for call in &mut self.calls {
            if call.state == CallState::Open {
                call.state = CallState::Failed;
                errors.push(AssemblerError {
                    id: call.id.clone(),
                    reason: reason.to_string(),
                    partial_json: call.buffer.clone(),
                });
            }
        }
        errors
    }

    /// Whether any call is still buffering.
    pub fn has_open_calls(&self) -> bool {
        self.calls.iter().any(|c| c.state == CallState::Open)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
