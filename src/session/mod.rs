pub mod manager;
pub mod store;

pub use manager::SessionManager;
pub use store::{SessionStore, SessionSummary};

use crate::security::label::ContentLabel;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
    ToolResult,
}

/// One message in a session's ordered conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMessage {
    pub role: Role,
    pub content: String,
    pub label: ContentLabel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub redacted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ConversationMessage {
    pub fn new(role: Role, content: impl Into<String>, label: ContentLabel) -> Self {
        Self {
            role,
            content: content.into(),
            label,
            tokens: None,
            redacted: false,
            tool_call_id: None,
            tool_name: None,
            timestamp: Utc::now(),
        }
    }
}

/// Result of one executed tool call as recorded on a turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallResult {
    pub success: bool,
    pub output: String,
    pub label: ContentLabel,
}

/// One tool call within a turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    pub args: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ToolCallResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved: Option<bool>,
    /// Milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn add(&mut self, other: Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// One user message and everything the model did with it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Turn {
    pub id: String,
    pub number: usize,
    pub user_message: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assistant_response: Option<String>,
    pub usage: Usage,
    pub start: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Turn {
    pub fn new(number: usize, user_message: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            number,
            user_message: user_message.into(),
            tool_calls: Vec::new(),
            assistant_response: None,
            usage: Usage::default(),
            start: Utc::now(),
            end: None,
            error: None,
        }
    }
}

/// A conversation with its turns, messages, grants, and accounting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    #[serde(default)]
    pub turns: Vec<Turn>,
    #[serde(default)]
    pub messages: Vec<ConversationMessage>,
    #[serde(default)]
    pub granted_approvals: HashSet<String>,
    #[serde(default)]
    pub total_usage: Usage,
    #[serde(default)]
    pub estimated_cost: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            turns: Vec::new(),
            messages: Vec::new(),
            granted_approvals: HashSet::new(),
            total_usage: Usage::default(),
            estimated_cost: 0.0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Append a message, pruning the oldest beyond `max_messages`.
    pub fn add_message(&mut self, message: ConversationMessage, max_messages: usize) {
        self.messages.push(message);
        self.updated_at = Utc::now();
        if max_messages > 0 && self.messages.len() > max_messages {
            let drain = self.messages.len() - max_messages;
            self.messages.drain(..drain);
        }
    }

    pub fn record_turn(&mut self, turn: Turn) {
        self.total_usage.add(turn.usage);
        self.turns.push(turn);
        self.updated_at = Utc::now();
    }

    /// The most recent `max` messages, oldest first.
    pub fn history(&self, max: usize) -> &[ConversationMessage] {
        let start = self.messages.len().saturating_sub(max);
        &self.messages[start..]
    }

    pub fn next_turn_number(&self) -> usize {
        self.turns.len() + 1
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::label::{DataClass, TrustLevel};

    fn msg(content: &str) -> ConversationMessage {
        ConversationMessage::new(Role::User, content, ContentLabel::user_input())
    }

    #[test]
    fn add_message_prunes_at_capacity() {
        let mut session = Session::new();
        for i in 0..10 {
            session.add_message(msg(&format!("m{}", i)), 5);
        }
        assert_eq!(session.messages.len(), 5);
        assert_eq!(session.messages[0].content, "m5");
        assert_eq!(session.messages[4].content, "m9");
    }

    #[test]
    fn history_returns_most_recent() {
        let mut session = Session::new();
        for i in 0..5 {
            session.add_message(msg(&format!("m{}", i)), 100);
        }
        let hist = session.history(2);
        assert_eq!(hist.len(), 2);
        assert_eq!(hist[0].content, "m3");
    }

    #[test]
    fn record_turn_accumulates_usage() {
        let mut session = Session::new();
        let mut turn = Turn::new(1, "hello");
        turn.usage = Usage {
            input_tokens: 100,
            output_tokens: 20,
        };
        session.record_turn(turn);
        let mut turn = Turn::new(2, "again");
        turn.usage = Usage {
            input_tokens: 50,
            output_tokens: 10,
        };
        session.record_turn(turn);

        assert_eq!(session.total_usage.input_tokens, 150);
        assert_eq!(session.total_usage.output_tokens, 30);
        assert_eq!(session.next_turn_number(), 3);
    }

    #[test]
    fn message_serde_roundtrip_preserves_label() {
        let mut message = ConversationMessage::new(
            Role::ToolResult,
            "output",
            ContentLabel::new(TrustLevel::Untrusted, DataClass::Sensitive, "web_fetch"),
        );
        message.tool_call_id = Some("tc_1".to_string());
        message.tool_name = Some("web_fetch".to_string());
        message.redacted = true;

        let json = serde_json::to_string(&message).unwrap();
        let back: ConversationMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.label, message.label);
        assert_eq!(back.tool_call_id.as_deref(), Some("tc_1"));
        assert!(back.redacted);
    }
}
