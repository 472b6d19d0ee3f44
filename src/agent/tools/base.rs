use crate::net::ToolNetworkPolicy;
use crate::security::label::{DataClass, TrustLevel};
use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;

/// When the gateway must ask before running a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalPolicy {
    /// Runs without a prompt unless a danger pattern or method rule fires.
    Auto,
    /// Every distinct normalized target needs a grant.
    Ask,
}

/// Side-effect classification for an action, surfaced on approval prompts.
#[derive(Debug, Clone, Copy, Default)]
pub struct ActionTraits {
    pub destructive: bool,
    pub affects_others: bool,
    pub financial_impact: bool,
}

/// Static capability metadata the gateway enforces for a tool.
#[derive(Debug, Clone)]
pub struct ToolCapability {
    pub approval: ApprovalPolicy,
    /// Network policy for tools that egress; its presence marks the tool as
    /// network-outbound and subject to the guard.
    pub network_policy: Option<ToolNetworkPolicy>,
    /// Trust/data-class the tool's raw output carries before elevation.
    pub output_trust: TrustLevel,
    pub output_class: DataClass,
    /// Regex sources; a match on the approval target forces a dangerous,
    /// approval-required call regardless of `approval`.
    pub danger_patterns: Vec<String>,
    /// HTTP methods that force an approval even under `Auto`.
    pub methods_requiring_approval: Vec<String>,
    /// Output cap in bytes, overridable per deployment via config.
    pub output_cap: usize,
    pub traits: ActionTraits,
    /// Wall-clock execution budget.
    pub timeout: Duration,
}

impl Default for ToolCapability {
    fn default() -> Self {
        Self {
            approval: ApprovalPolicy::Ask,
            network_policy: None,
            output_trust: TrustLevel::Untrusted,
            output_class: DataClass::Internal,
            danger_patterns: Vec::new(),
            methods_requiring_approval: Vec::new(),
            output_cap: 100_000,
            traits: ActionTraits::default(),
            timeout: Duration::from_secs(120),
        }
    }
}

/// Per-call context. Fresh for every invocation; tools share no process
/// globals with one another.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub session_id: String,
    pub user_id: String,
    pub work_dir: PathBuf,
    /// Combined label of tool output the model has already seen this turn.
    /// The egress flow table is evaluated against it for network tools:
    /// arguments are model-authored, so anything the model read may have
    /// flowed into them.
    pub context_label: Option<crate::security::label::ContentLabel>,
}

/// Raw tool output before the gateway's post-processing pipeline.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub success: bool,
    pub output: String,
}

impl ToolOutput {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
        }
    }

    pub fn fail(output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
        }
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for the arguments; validated by the gateway before
    /// execution.
    fn parameters(&self) -> Value;
    fn capability(&self) -> ToolCapability;

    /// Verb for the approval id (`read`, `write`, `execute`, `get`).
    fn action(&self) -> &str;

    /// The approval target derived from validated args: url for network
    /// tools, command for shell, path for file tools. `None` when the
    /// relevant argument is missing.
    fn approval_target(&self, args: &Value) -> Option<String>;

    /// HTTP method this call will use, for method-gated approval rules.
    fn request_method(&self, _args: &Value) -> Option<String> {
        None
    }

    /// Syntax-aware danger analysis for tools with structured targets
    /// (shell commands). `None` defers to the gateway's regex match of
    /// `danger_patterns` against the raw target.
    fn analyze_danger(&self, _target: &str) -> Option<bool> {
        None
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> anyhow::Result<ToolOutput>;
}
