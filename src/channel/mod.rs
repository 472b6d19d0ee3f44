//! Channel contract: the typed message stream between the core and a
//! front-end surface (CLI, WebSocket, Telegram). Channels must preserve the
//! ordering of `send` calls.

pub mod cli;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    Disconnected,
    Connected,
}

/// Typed messages emitted by the core toward the channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelMessage {
    UserMessage {
        content: String,
    },
    AssistantMessage {
        content: String,
    },
    StreamStart,
    StreamDelta {
        text: String,
    },
    StreamEnd,
    ToolUse {
        id: String,
        name: String,
        /// Human-readable target (already normalized; never raw arguments).
        target: String,
    },
    ToolResult {
        id: String,
        name: String,
        success: bool,
        /// Redacted and capped by the gateway before it reaches any channel.
        output: String,
    },
    ApprovalRequest {
        approval_id: String,
        tool: String,
        action: String,
        target: String,
        is_dangerous: bool,
    },
    ApprovalResponse {
        approval_id: String,
        approved: bool,
    },
    System {
        text: String,
    },
    Error {
        code: String,
        message: String,
    },
}

/// A front-end surface. Implementations must deliver messages in the order
/// `send` was called.
#[async_trait]
pub trait Channel: Send + Sync {
    async fn connect(&self) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;
    async fn send(&self, message: ChannelMessage) -> Result<()>;
    fn state(&self) -> ChannelState;
    fn session_id(&self) -> &str;
}
