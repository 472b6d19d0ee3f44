//! Terminal channel: renders the typed message stream to stdout.

use crate::channel::{Channel, ChannelMessage, ChannelState};
use anyhow::Result;
use async_trait::async_trait;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};

pub struct CliChannel {
    session_id: String,
    connected: AtomicBool,
    /// Suppress tool/stream chrome (for `demo run` style output).
    quiet: bool,
}

impl CliChannel {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            connected: AtomicBool::new(false),
            quiet: false,
        }
    }

    pub fn quiet(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            connected: AtomicBool::new(false),
            quiet: true,
        }
    }
}

#[async_trait]
impl Channel for CliChannel {
    async fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, message: ChannelMessage) -> Result<()> {
        let mut out = std::io::stdout().lock();
        match message {
            ChannelMessage::StreamDelta { text } => {
                write!(out, "{}", text)?;
                out.flush()?;
            }
            ChannelMessage::StreamEnd => writeln!(out)?,
            ChannelMessage::AssistantMessage { .. } | ChannelMessage::StreamStart => {}
            ChannelMessage::ToolUse { name, target, .. } => {
                if !self.quiet {
                    writeln!(out, "⚙ {} {}", name, target)?;
                }
            }
            ChannelMessage::ToolResult { name, success, .. } => {
                if !self.quiet {
                    let mark = if success { "✓" } else { "✗" };
                    writeln!(out, "{} {}", mark, name)?;
                }
            }
            ChannelMessage::ApprovalRequest {
                tool,
                target,
                is_dangerous,
                ..
            } => {
                // The actual y/n read happens in the approval prompt; this is
                // the visible banner. Dangerous operations are unmissable.
                if is_dangerous {
                    writeln!(out, "‼ DANGEROUS OPERATION: {} → {}", tool, target)?;
                } else {
                    writeln!(out, "? approval needed: {} → {}", tool, target)?;
                }
            }
            ChannelMessage::ApprovalResponse { approved, .. } => {
                if !self.quiet {
                    writeln!(out, "{}", if approved { "approved" } else { "denied" })?;
                }
            }
            ChannelMessage::System { text } => writeln!(out, "[system] {}", text)?,
            ChannelMessage::Error { code, message } => {
                writeln!(out, "[error:{}] {}", code, message)?;
            }
            ChannelMessage::UserMessage { .. } => {}
        }
        Ok(())
    }

    fn state(&self) -> ChannelState {
        if self.connected.load(Ordering::SeqCst) {
            ChannelState::Connected
        } else {
            ChannelState::Disconnected
        }
    }

    fn session_id(&self) -> &str {
        &self.session_id
    }
}
