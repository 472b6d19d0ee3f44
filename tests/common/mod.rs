// Shared test helpers — not every test binary uses every item.
#![allow(unused)]

use async_trait::async_trait;
use meao::agent::tools::filesystem::{ReadFileTool, WriteFileTool};
use meao::agent::tools::shell::BashTool;
use meao::agent::tools::web::WebFetchTool;
use meao::agent::tools::ToolGateway;
use meao::agent::{Orchestrator, OrchestratorConfig};
use meao::approval::{ApprovalDecision, ApprovalManager, ApprovalPrompt, ApprovalScope};
use meao::audit::{AuditLogger, AuditQuery};
use meao::channel::{Channel, ChannelMessage, ChannelState};
use meao::config::{NetworkConfig, NetworkRule, SandboxConfig, SandboxTier};
use meao::errors::MeaoError;
use meao::net::dns::DnsResolver;
use meao::net::NetworkGuard;
use meao::providers::base::{
    ChatRequest, Message, ModelProvider, ModelResponse, RetryConfig, StopReason, StreamEvent,
    StreamHandler,
};
use meao::sandbox::SandboxExecutor;
use meao::security::secrets::SecretDetector;
use meao::session::{Session, SessionManager};
use serde_json::{json, Value};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One scripted model pass: the events to emit and the summary to return.
pub type Pass = (Vec<StreamEvent>, ModelResponse);

pub fn tool_pass(id: &str, name: &str, args: Value) -> Pass {
    tool_pass_split(id, name, &[&args.to_string()])
}

/// Tool pass with the input JSON split into explicit fragments.
pub fn tool_pass_split(id: &str, name: &str, fragments: &[&str]) -> Pass {
    let mut events = vec![
        StreamEvent::MessageStart { input_tokens: 40 },
        StreamEvent::ToolUseStart {
            id: id.to_string(),
            name: name.to_string(),
        },
    ];
    for fragment in fragments {
        events.push(StreamEvent::InputJsonDelta {
            id: id.to_string(),
            partial_json: (*fragment).to_string(),
        });
    }
    events.push(StreamEvent::ContentBlockStop {
        tool_call_id: Some(id.to_string()),
    });
    events.push(StreamEvent::MessageDelta {
        stop_reason: Some(StopReason::ToolUse),
        output_tokens: 12,
    });
    events.push(StreamEvent::MessageStop);
    (
        events,
        ModelResponse {
            content: None,
            stop_reason: Some(StopReason::ToolUse),
            input_tokens: 40,
            output_tokens: 12,
            completed: true,
        },
    )
}

pub fn text_pass(text: &str) -> Pass {
    (
        vec![
            StreamEvent::MessageStart { input_tokens: 30 },
            StreamEvent::TextDelta {
                text: text.to_string(),
            },
            StreamEvent::ContentBlockStop { tool_call_id: None },
            StreamEvent::MessageDelta {
                stop_reason: Some(StopReason::EndTurn),
                output_tokens: 8,
            },
            StreamEvent::MessageStop,
        ],
        ModelResponse {
            content: Some(text.to_string()),
            stop_reason: Some(StopReason::EndTurn),
            input_tokens: 30,
            output_tokens: 8,
            completed: true,
        },
    )
}

/// A pass whose stream breaks before message_stop, leaving a tool call open.
pub fn disconnect_pass(id: &str, name: &str, partial: &str) -> Pass {
    (
        vec![
            StreamEvent::MessageStart { input_tokens: 40 },
            StreamEvent::ToolUseStart {
                id: id.to_string(),
                name: name.to_string(),
            },
            StreamEvent::InputJsonDelta {
                id: id.to_string(),
                partial_json: partial.to_string(),
            },
        ],
        ModelResponse {
            content: None,
            stop_reason: None,
            input_tokens: 40,
            output_tokens: 0,
            completed: false,
        },
    )
}

/// Scripted provider: replays passes in order and records every request.
pub struct ScriptedProvider {
    passes: Mutex<Vec<Pass>>,
    pub requests: Mutex<Vec<Vec<Message>>>,
    pub fail_with: Mutex<Option<fn() -> MeaoError>>,
}

impl ScriptedProvider {
    pub fn new(passes: Vec<Pass>) -> Self {
        Self {
            passes: Mutex::new(passes),
            requests: Mutex::new(Vec::new()),
            fail_with: Mutex::new(None),
        }
    }

    pub fn failing(error: fn() -> MeaoError) -> Self {
        Self {
            passes: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            fail_with: Mutex::new(Some(error)),
        }
    }

    pub fn recorded_requests(&self) -> Vec<Vec<Message>> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    async fn create_message_stream(
        &self,
        req: ChatRequest<'_>,
        on_event: &StreamHandler<'_>,
    ) -> Result<ModelResponse, MeaoError> {
        self.requests.lock().unwrap().push(req.messages.clone());
        if let Some(error) = *self.fail_with.lock().unwrap() {
            return Err(error());
        }
        let (events, response) = {
            let mut passes = self.passes.lock().unwrap();
            if passes.is_empty() {
                (
                    Vec::new(),
                    ModelResponse {
                        content: Some("(script exhausted)".to_string()),
                        stop_reason: Some(StopReason::EndTurn),
                        completed: true,
                        ..ModelResponse::default()
                    },
                )
            } else {
                passes.remove(0)
            }
        };
        for event in events {
            on_event(event);
        }
        Ok(response)
    }

    fn default_model(&self) -> &str {
        "scripted"
    }
}

/// Channel double that records every message in order.
pub struct BufferChannel {
    session_id: String,
    pub sent: Mutex<Vec<ChannelMessage>>,
}

impl BufferChannel {
    pub fn new() -> Self {
        Self {
            session_id: "test".to_string(),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn messages(&self) -> Vec<ChannelMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Channel for BufferChannel {
    async fn connect(&self) -> anyhow::Result<()> {
        Ok(())
    }
    async fn disconnect(&self) -> anyhow::Result<()> {
        Ok(())
    }
    async fn send(&self, message: ChannelMessage) -> anyhow::Result<()> {
        self.sent.lock().unwrap().push(message);
        Ok(())
    }
    fn state(&self) -> ChannelState {
        ChannelState::Connected
    }
    fn session_id(&self) -> &str {
        &self.session_id
    }
}

pub struct FixedResolver(pub IpAddr);

#[async_trait]
impl DnsResolver for FixedResolver {
    async fn resolve(&self, _host: &str) -> Result<Vec<IpAddr>, String> {
        Ok(vec![self.0])
    }
}

pub fn approving_prompt(scope: ApprovalScope) -> ApprovalPrompt {
    Box::new(move |_req| {
        Box::pin(async move {
            Some(ApprovalDecision {
                approved: true,
                remember: scope,
            })
        })
    })
}

pub fn denying_prompt() -> ApprovalPrompt {
    Box::new(|_req| {
        Box::pin(async {
            Some(ApprovalDecision {
                approved: false,
                remember: ApprovalScope::Once,
            })
        })
    })
}

/// Everything a scenario needs, wired over temp directories.
pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub provider: Arc<ScriptedProvider>,
    pub channel: Arc<BufferChannel>,
    pub audit: Arc<AuditLogger>,
    pub sessions: Arc<SessionManager>,
    pub session_id: String,
    pub work_dir: PathBuf,
    _base: tempfile::TempDir,
}

pub struct HarnessOptions {
    pub passes: Vec<Pass>,
    pub prompt: Option<ApprovalPrompt>,
    pub max_tool_calls: usize,
    pub provider_error: Option<fn() -> MeaoError>,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            passes: Vec::new(),
            prompt: None,
            max_tool_calls: 25,
            provider_error: None,
        }
    }
}

pub async fn harness(options: HarnessOptions) -> Harness {
    let base = tempfile::tempdir().unwrap();
    let work_dir = base.path().join("workspace");
    std::fs::create_dir_all(&work_dir).unwrap();

    let detector = Arc::new(SecretDetector::new());
    let audit = Arc::new(
        AuditLogger::new(base.path().join("audit"), detector.clone()).unwrap(),
    );
    let approvals = Arc::new(ApprovalManager::new(Duration::from_secs(5)));
    if let Some(prompt) = options.prompt {
        approvals.set_prompt(prompt).await;
    }

    let guard = Arc::new(NetworkGuard::new(
        NetworkConfig {
            allowlist: vec![NetworkRule {
                host: "*.example.com".to_string(),
                methods: None,
            }],
            ..NetworkConfig::default()
        },
        Arc::new(FixedResolver("93.184.216.34".parse().unwrap())),
    ));

    let executor = Arc::new(SandboxExecutor::new(
        SandboxConfig {
            tier: SandboxTier::Process,
            ..SandboxConfig::default()
        },
        audit.clone(),
    ));

    let mut gateway = ToolGateway::new(
        approvals.clone(),
        guard.clone(),
        detector.clone(),
        audit.clone(),
        std::collections::HashMap::new(),
    );
    gateway.register(Arc::new(ReadFileTool::new(200_000))).unwrap();
    gateway.register(Arc::new(WriteFileTool)).unwrap();
    gateway
        .register(Arc::new(
            BashTool::new(executor, Duration::from_secs(30), 100_000).unwrap(),
        ))
        .unwrap();
    gateway
        .register(Arc::new(WebFetchTool::new(
            guard.clone(),
            Duration::from_secs(5),
            50_000,
        )))
        .unwrap();
    let gateway = Arc::new(gateway);

    let sessions = Arc::new(SessionManager::new(base.path().to_path_buf()).unwrap());
    let session = Session::new();
    let session_id = session.id.clone();

    let provider = Arc::new(match options.provider_error {
        Some(error) => ScriptedProvider::failing(error),
        None => ScriptedProvider::new(options.passes),
    });
    let channel = Arc::new(BufferChannel::new());
    let channel_dyn: Arc<dyn Channel> = channel.clone();

    let config = OrchestratorConfig {
        max_tool_calls_per_turn: options.max_tool_calls,
        work_dir: work_dir.clone(),
        retry: RetryConfig {
            max_retries: 0,
            initial_delay_ms: 1,
            max_delay_ms: 1,
            backoff_multiplier: 1.0,
        },
        ..OrchestratorConfig::default()
    };
    let orchestrator = Arc::new(Orchestrator::new(
        provider.clone(),
        gateway,
        sessions.clone() as Arc<dyn meao::session::SessionStore>,
        &channel_dyn,
        audit.clone(),
        detector,
        config,
        session,
    ));
    orchestrator.start();

    Harness {
        orchestrator,
        provider,
        channel,
        audit,
        sessions,
        session_id,
        work_dir,
        _base: base,
    }
}

/// Await the ordered channel forwarder draining (delivery is async).
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

pub fn audit_actions(audit: &AuditLogger) -> Vec<String> {
    audit
        .query(&AuditQuery::default())
        .unwrap()
        .into_iter()
        .map(|e| e.action)
        .collect()
}
