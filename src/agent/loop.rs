//! The turn loop: model request → stream consumption → tool dispatch →
//! feedback → repeat, bounded per turn and strictly sequential.

use crate::agent::assembler::{AssembledToolCall, AssemblerError, ToolCallAssembler};
use crate::agent::tools::base::{ApprovalPolicy, ToolContext};
use crate::agent::tools::gateway::ToolGateway;
use crate::audit::{AuditCategory, AuditEvent, AuditLogger, AuditSeverity};
use crate::channel::{Channel, ChannelMessage};
use crate::config::ModelCost;
use crate::errors::MeaoError;
use crate::providers::base::{
    ChatRequest, Message, ModelProvider, RetryConfig, StopReason, StreamEvent, ToolCallRef,
};
use crate::security::label::ContentLabel;
use crate::security::secrets::SecretDetector;
use crate::session::{
    ConversationMessage, Role, Session, SessionStore, ToolCallRecord, ToolCallResult, Turn, Usage,
};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Observable orchestrator state, for surfaces that render activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Idle,
    Processing,
    Streaming,
    ExecutingTool,
    WaitingApproval,
    Error,
}

pub struct OrchestratorConfig {
    pub max_tool_calls_per_turn: usize,
    pub max_messages: usize,
    pub model: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub model_cost: ModelCost,
    pub work_dir: PathBuf,
    pub user_id: String,
    pub retry: RetryConfig,
    pub system_prompt: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_tool_calls_per_turn: 25,
            max_messages: 200,
            model: None,
            max_tokens: 4096,
            temperature: 0.7,
            model_cost: ModelCost {
                input_per_mtok: 3.0,
                output_per_mtok: 15.0,
            },
            work_dir: std::env::temp_dir(),
            user_id: "local".to_string(),
            retry: RetryConfig::default(),
            system_prompt: "You are meao, a local agent. Use the available tools to help the \
                            user; prefer reading before writing and keep commands minimal."
                .to_string(),
        }
    }
}

/// What one stream pass produced, reassembled for dispatch.
struct StreamPass {
    assistant_text: Option<String>,
    calls: Vec<AssembledToolCall>,
    failures: Vec<AssemblerError>,
    stop_reason: Option<StopReason>,
    usage: Usage,
    completed: bool,
}

/// Drives a single session's turns. One orchestrator per session; the
/// processing lock makes turns strictly sequential.
pub struct Orchestrator {
    provider: Arc<dyn ModelProvider>,
    gateway: Arc<ToolGateway>,
    sessions: Arc<dyn SessionStore>,
    audit: Arc<AuditLogger>,
    detector: Arc<SecretDetector>,
    config: OrchestratorConfig,
    session: Mutex<Session>,
    state: StdMutex<AgentState>,
    running: AtomicBool,
    processing_lock: Mutex<()>,
    /// Single ordered queue into the channel: `send` order is delivery order
    /// even though delivery itself is async.
    outbound_tx: tokio::sync::mpsc::UnboundedSender<ChannelMessage>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        gateway: Arc<ToolGateway>,
        sessions: Arc<dyn SessionStore>,
        channel: &Arc<dyn Channel>,
        audit: Arc<AuditLogger>,
        detector: Arc<SecretDetector>,
        config: OrchestratorConfig,
        session: Session,
    ) -> Self {
        // The channel is held weakly (it may hold the orchestrator in turn);
        // a dedicated forwarder drains the queue so ordering survives the
        // async boundary.
        let (outbound_tx, mut outbound_rx) =
            tokio::sync::mpsc::unbounded_channel::<ChannelMessage>();
        let weak: Weak<dyn Channel> = Arc::downgrade(channel);
        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let Some(channel) = weak.upgrade() else { break };
                if let Err(e) = channel.send(message).await {
                    warn!("channel send failed: {}", e);
                }
            }
        });

        Self {
            provider,
            gateway,
            sessions,
            audit,
            detector,
            config,
            session: Mutex::new(session),
            state: StdMutex::new(AgentState::Idle),
            running: AtomicBool::new(false),
            processing_lock: Mutex::new(()),
            outbound_tx,
        }
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
        let session_id = self.session_id_blocking();
        let _ = self.audit.log(
            AuditEvent::new(AuditCategory::Session, "start", AuditSeverity::Info)
                .session(session_id),
        );
    }

    /// Stop accepting work. An in-flight turn aborts at its next loop check;
    /// sandbox children die via their kill-on-drop guards and a pending
    /// approval resolves as denial via its timeout.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let session_id = self.session_id_blocking();
        let _ = self.audit.log(
            AuditEvent::new(AuditCategory::Session, "stop", AuditSeverity::Info)
                .session(session_id),
        );
    }

    pub fn state(&self) -> AgentState {
        *self.state.lock().expect("state lock poisoned")
    }

    pub async fn session_snapshot(&self) -> Session {
        self.session.lock().await.clone()
    }

    /// Drop conversation history (turns and accounting are kept).
    pub async fn clear_history(&self) {
        let mut session = self.session.lock().await;
        session.messages.clear();
        if let Err(e) = self.sessions.save(&session).await {
            warn!("failed to persist session {}: {}", session.id, e);
        }
    }

    fn session_id_blocking(&self) -> String {
        // Used only from start/stop, which never race a held session lock
        self.session
            .try_lock()
            .map(|s| s.id.clone())
            .unwrap_or_default()
    }

    fn set_state(&self, state: AgentState) {
        *self.state.lock().expect("state lock poisoned") = state;
    }

    fn send_channel(&self, message: ChannelMessage) {
        let _ = self.outbound_tx.send(message);
    }

    /// Process one user message to completion: the turn ends when the model
    /// stops calling tools, the per-turn bound trips, or a fatal provider
    /// error surfaces.
    pub async fn process_message(&self, user_text: &str) -> Result<String, MeaoError> {
        let _turn_guard = self.processing_lock.lock().await;
        if !self.running.load(Ordering::SeqCst) {
            return Err(MeaoError::Session("orchestrator is stopped".to_string()));
        }
        self.set_state(AgentState::Processing);

        let result = self.run_turn(user_text).await;
        match &result {
            Ok(_) => self.set_state(AgentState::Idle),
            Err(_) => self.set_state(AgentState::Error),
        }
        result
    }

    async fn run_turn(&self, user_text: &str) -> Result<String, MeaoError> {
        // Redaction closure: everything appended to the session or shown on
        // a channel has passed the detector first
        let user_text = self.detector.redact_default(user_text);

        let (session_id, turn_number, mut working) = {
            let mut session = self.session.lock().await;
            // Replay is built before the new message lands so the working
            // set carries exactly one copy of it
            let replay = self.replay_messages(&session);
            let message =
                ConversationMessage::new(Role::User, user_text.clone(), ContentLabel::user_input());
            session.add_message(message, self.config.max_messages);
            (session.id.clone(), session.next_turn_number(), replay)
        };
        let mut turn = Turn::new(turn_number, user_text.clone());
        self.send_channel(ChannelMessage::UserMessage {
            content: user_text.clone(),
        });
        let _ = self.audit.log(
            AuditEvent::new(AuditCategory::Turn, "start", AuditSeverity::Info)
                .session(&session_id)
                .meta("turn", turn_number as u64),
        );
        working.push(Message::user(user_text));

        let base_ctx = ToolContext {
            session_id: session_id.clone(),
            user_id: self.config.user_id.clone(),
            work_dir: self.config.work_dir.clone(),
            context_label: None,
        };
        let tools = self.gateway.tool_definitions();
        let mut tool_calls_made = 0usize;
        let mut final_text = String::new();
        // Combined label of tool output the model has seen this turn; the
        // gateway evaluates egress flow control against it
        let mut turn_label: Option<ContentLabel> = None;

        loop {
            if !self.running.load(Ordering::SeqCst) {
                turn.error = Some("cancelled".to_string());
                break;
            }

            self.set_state(AgentState::Streaming);
            let pass = match self.stream_once(&working, &tools).await {
                Ok(pass) => pass,
                Err(e) => {
                    self.finish_turn_error(&session_id, &mut turn, &e).await;
                    return Err(e);
                }
            };

            turn.usage.add(pass.usage);

            // Assistant text and tool-call refs join the working conversation
            let assistant_text = pass.assistant_text.clone().unwrap_or_default();
            let refs: Vec<ToolCallRef> = pass
                .calls
                .iter()
                .map(|c| ToolCallRef {
                    id: c.id.clone(),
                    name: c.name.clone(),
                    arguments: c.arguments.clone(),
                })
                .collect();
            working.push(Message::assistant(assistant_text.clone(), refs));
            if !assistant_text.is_empty() {
                final_text = assistant_text;
            }

            // Assembly failures (bad JSON, disconnects) are reported to the
            // model as failed tool results, never executed
            for failure in &pass.failures {
                let text = format!("tool call could not be assembled: {}", failure.reason);
                working.push(Message::tool_result(&failure.id, &text, true));
                self.append_tool_result_message(&failure.id, "unknown", &text, true)
                    .await;
            }

            // Sequential dispatch in assembly-completion order
            for call in &pass.calls {
                if tool_calls_made >= self.config.max_tool_calls_per_turn {
                    let text = format!(
                        "tool call limit reached ({}); finish the turn with what you have",
                        self.config.max_tool_calls_per_turn
                    );
                    warn!("session {}: {}", session_id, text);
                    working.push(Message::tool_result(&call.id, &text, true));
                    self.append_tool_result_message(&call.id, &call.name, &text, true)
                        .await;
                    turn.error = Some("tool call limit exceeded".to_string());
                    continue;
                }
                tool_calls_made += 1;

                let needs_approval = self
                    .gateway
                    .get(&call.name)
                    .map(|t| t.capability().approval == ApprovalPolicy::Ask);
                self.set_state(match needs_approval {
                    Some(true) => AgentState::WaitingApproval,
                    _ => AgentState::ExecutingTool,
                });
                self.send_channel(ChannelMessage::ToolUse {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    target: call
                        .arguments
                        .as_object()
                        .and_then(|o| o.values().next())
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                });

                let ctx = ToolContext {
                    context_label: turn_label.clone(),
                    ..base_ctx.clone()
                };
                let dispatch = {
                    let mut session = self.session.lock().await;
                    let mut grants = std::mem::take(&mut session.granted_approvals);
                    drop(session);
                    let dispatch = self.gateway.dispatch(call, &mut grants, &ctx).await;
                    let mut session = self.session.lock().await;
                    session.granted_approvals = grants;
                    dispatch
                };
                self.set_state(AgentState::ExecutingTool);
                if dispatch.success {
                    turn_label = Some(match turn_label {
                        Some(label) => label.combine(&dispatch.label),
                        None => dispatch.label.clone(),
                    });
                }

                turn.tool_calls.push(ToolCallRecord {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    args: call.arguments.clone(),
                    result: Some(ToolCallResult {
                        success: dispatch.success,
                        output: dispatch.output.clone(),
                        label: dispatch.label.clone(),
                    }),
                    approved: dispatch.approved,
                    execution_time_ms: Some(dispatch.execution_time.as_millis() as u64),
                });

                // The tool call is recorded on the turn before its result
                // message is appended
                working.push(Message::tool_result(
                    &call.id,
                    &dispatch.output,
                    !dispatch.success,
                ));
                {
                    let mut session = self.session.lock().await;
                    let mut message = ConversationMessage::new(
                        Role::ToolResult,
                        dispatch.output.clone(),
                        dispatch.label.clone(),
                    );
                    message.tool_call_id = Some(call.id.clone());
                    message.tool_name = Some(call.name.clone());
                    session.add_message(message, self.config.max_messages);
                }
                self.send_channel(ChannelMessage::ToolResult {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    success: dispatch.success,
                    output: dispatch.output.clone(),
                });
            }

            match pass.stop_reason {
                Some(StopReason::ToolUse) if turn.error.is_none() => {
                    debug!("session {}: continuing after tool_use", session_id);
                    continue;
                }
                Some(StopReason::ToolUse) => break, // bound tripped
                Some(StopReason::EndTurn | StopReason::MaxTokens | StopReason::StopSequence) => {
                    break;
                }
                None => {
                    // No stop reason: either a clean but reason-less stream
                    // or a disconnect. With failure results or executed calls
                    // in the working set the model gets another pass to
                    // correct itself; otherwise the turn ends here.
                    if pass.calls.is_empty() && pass.failures.is_empty() {
                        if !pass.completed {
                            turn.error = Some("stream disconnected".to_string());
                        }
                        break;
                    }
                    continue;
                }
            }
        }

        // Close out the turn
        let final_redacted = self.detector.redact_default(&final_text);
        {
            let mut session = self.session.lock().await;
            if !final_redacted.is_empty() {
                let message = ConversationMessage::new(
                    Role::Assistant,
                    final_redacted.clone(),
                    ContentLabel::system("assistant"),
                );
                session.add_message(message, self.config.max_messages);
            }
            turn.assistant_response = Some(final_redacted.clone());
            turn.end = Some(chrono::Utc::now());
            let cost = self.estimate_cost(turn.usage);
            session.estimated_cost += cost;
            session.record_turn(turn.clone());
            if let Err(e) = self.sessions.save(&session).await {
                warn!("failed to persist session {}: {}", session.id, e);
            }
        }
        self.send_channel(ChannelMessage::AssistantMessage {
            content: final_redacted.clone(),
        });
        let _ = self.audit.log(
            AuditEvent::new(AuditCategory::Turn, "complete", AuditSeverity::Info)
                .session(&session_id)
                .meta("turn", turn.number as u64)
                .meta("toolCalls", turn.tool_calls.len() as u64)
                .meta("inputTokens", turn.usage.input_tokens)
                .meta("outputTokens", turn.usage.output_tokens),
        );
        info!(
            "session {}: turn {} complete ({} tool calls)",
            session_id,
            turn.number,
            turn.tool_calls.len()
        );
        Ok(final_redacted)
    }

    /// One streamed model pass: consume events, feed the assembler, forward
    /// text deltas to the channel in order.
    async fn stream_once(
        &self,
        working: &[Message],
        tools: &[crate::providers::base::ToolDefinition],
    ) -> Result<StreamPass, MeaoError> {
        let assembler = StdMutex::new(ToolCallAssembler::new());
        let calls = StdMutex::new(Vec::<AssembledToolCall>::new());
        let failures = StdMutex::new(Vec::<AssemblerError>::new());
        let deltas = StdMutex::new(VecDeque::<String>::new());

        self.send_channel(ChannelMessage::StreamStart);

        let handler = |event: StreamEvent| match event {
            StreamEvent::TextDelta { text } => {
                deltas
                    .lock()
                    .expect("delta queue lock poisoned")
                    .push_back(text);
            }
            StreamEvent::ToolUseStart { id, name } => {
                assembler
                    .lock()
                    .expect("assembler lock poisoned")
                    .start(&id, &name);
            }
            StreamEvent::InputJsonDelta { id, partial_json } => {
                assembler
                    .lock()
                    .expect("assembler lock poisoned")
                    .add_delta(&id, &partial_json);
            }
            StreamEvent::ContentBlockStop { tool_call_id } => {
                if let Some(id) = tool_call_id {
                    let result = assembler
                        .lock()
                        .expect("assembler lock poisoned")
                        .end(&id);
                    match result {
                        Ok(call) => calls.lock().expect("calls lock poisoned").push(call),
                        Err(e) => failures.lock().expect("failures lock poisoned").push(e),
                    }
                }
            }
            StreamEvent::MessageStart { .. }
            | StreamEvent::MessageDelta { .. }
            | StreamEvent::MessageStop => {}
        };

        let req = ChatRequest {
            messages: working.to_vec(),
            tools: tools.to_vec(),
            model: self.config.model.as_deref(),
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        };
        let response = self
            .provider
            .stream_with_retry(req, &handler, Some(self.config.retry.clone()))
            .await?;

        // Forward buffered deltas in order, redacted as a whole stream
        let text: String = deltas
            .lock()
            .expect("delta queue lock poisoned")
            .drain(..)
            .collect();
        if !text.is_empty() {
            self.send_channel(ChannelMessage::StreamDelta {
                text: self.detector.redact_default(&text),
            });
        }
        self.send_channel(ChannelMessage::StreamEnd);

        // Release the closure's borrows before consuming the mutexes
        drop(handler);

        let mut failures = failures.into_inner().expect("failures lock poisoned");
        if !response.completed {
            let mut assembler = assembler.into_inner().expect("assembler lock poisoned");
            failures.extend(assembler.fail_incomplete("stream disconnected before completion"));
        }

        Ok(StreamPass {
            assistant_text: response.content,
            calls: calls.into_inner().expect("calls lock poisoned"),
            failures,
            stop_reason: response.stop_reason,
            usage: Usage {
                input_tokens: response.input_tokens,
                output_tokens: response.output_tokens,
            },
            completed: response.completed,
        })
    }

    /// Cross-turn replay: system prompt plus stored user/assistant text.
    /// Intra-turn tool exchanges live only in the working set of the turn
    /// that produced them.
    fn replay_messages(&self, session: &Session) -> Vec<Message> {
        let mut messages = vec![Message::system(&self.config.system_prompt)];
        for msg in session.history(self.config.max_messages) {
            match msg.role {
                Role::User => messages.push(Message::user(&msg.content)),
                Role::Assistant => messages.push(Message::assistant(&msg.content, Vec::new())),
                Role::System | Role::ToolResult => {}
            }
        }
        messages
    }

    async fn append_tool_result_message(
        &self,
        call_id: &str,
        tool_name: &str,
        text: &str,
        _is_error: bool,
    ) {
        let mut session = self.session.lock().await;
        let mut message = ConversationMessage::new(
            Role::ToolResult,
            text.to_string(),
            ContentLabel::system("tool_gateway"),
        );
        message.tool_call_id = Some(call_id.to_string());
        message.tool_name = Some(tool_name.to_string());
        session.add_message(message, self.config.max_messages);
    }

    async fn finish_turn_error(&self, session_id: &str, turn: &mut Turn, error: &MeaoError) {
        let code = match error {
            MeaoError::Auth(_) => "provider_auth",
            MeaoError::ContextLength(_) => "context_length",
            MeaoError::RateLimit { .. } => "rate_limited",
            MeaoError::Provider { .. } => "provider_error",
            _ => "internal",
        };
        turn.error = Some(error.to_string());
        turn.end = Some(chrono::Utc::now());
        {
            let mut session = self.session.lock().await;
            session.record_turn(turn.clone());
            if let Err(e) = self.sessions.save(&session).await {
                warn!("failed to persist session {}: {}", session.id, e);
            }
        }
        self.send_channel(ChannelMessage::Error {
            code: code.to_string(),
            message: self.detector.redact_default(&error.to_string()),
        });
        let _ = self.audit.log(
            AuditEvent::new(AuditCategory::Turn, "failed", AuditSeverity::Error)
                .session(session_id)
                .meta("error", error.to_string()),
        );
    }

    fn estimate_cost(&self, usage: Usage) -> f64 {
        let rates = self.config.model_cost;
        (usage.input_tokens as f64 / 1_000_000.0) * rates.input_per_mtok
            + (usage.output_tokens as f64 / 1_000_000.0) * rates.output_per_mtok
    }
}
