use crate::agent::assembler::AssembledToolCall;
use crate::agent::tools::base::{ApprovalPolicy, Tool, ToolContext};
use crate::approval::{compute_approval_id, ApprovalManager, ApprovalOutcome, ApprovalRequest};
use crate::audit::{AuditCategory, AuditEvent, AuditLogger, AuditSeverity};
use crate::net::NetworkGuard;
use crate::providers::base::ToolDefinition;
use crate::security::flow::{self, FlowDecision, FlowDestination};
use crate::security::label::{ContentLabel, DataClass};
use crate::security::secrets::{Confidence, SecretDetector};
use anyhow::{Context, Result};
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, warn};

/// Final result of one gateway dispatch, ready to append as a tool-result
/// message.
#[derive(Debug, Clone)]
pub struct ToolDispatch {
    pub success: bool,
    pub output: String,
    pub label: ContentLabel,
    pub truncated: bool,
    pub execution_time: Duration,
    /// `None` when no approval was required.
    pub approved: Option<bool>,
}

struct ToolEntry {
    tool: Arc<dyn Tool>,
    validator: jsonschema::Validator,
    danger: Vec<Regex>,
}

/// The single dispatch point for tool execution: validation, approvals,
/// network policy, execution guards, and output post-processing.
pub struct ToolGateway {
    tools: HashMap<String, ToolEntry>,
    approvals: Arc<ApprovalManager>,
    guard: Arc<NetworkGuard>,
    detector: Arc<SecretDetector>,
    audit: Arc<AuditLogger>,
    /// Per-tool output cap overrides from config.
    output_caps: HashMap<String, usize>,
}

impl ToolGateway {
    pub fn new(
        approvals: Arc<ApprovalManager>,
        guard: Arc<NetworkGuard>,
        detector: Arc<SecretDetector>,
        audit: Arc<AuditLogger>,
        output_caps: HashMap<String, usize>,
    ) -> Self {
        Self {
            tools: HashMap::new(),
            approvals,
            guard,
            detector,
            audit,
            output_caps,
        }
    }

    /// Register a tool, compiling its schema validator and danger patterns.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<()> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            warn!("tool gateway: overwriting duplicate tool '{}'", name);
        }
        let schema = tool.parameters();
        let validator = jsonschema::validator_for(&schema)
            .with_context(|| format!("invalid parameter schema for tool '{}'", name))?;
        let danger = tool
            .capability()
            .danger_patterns
            .iter()
            .filter_map(|p| match Regex::new(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!("tool '{}': bad danger pattern '{}': {}", name, p, e);
                    None
                }
            })
            .collect();
        self.tools.insert(
            name,
            ToolEntry {
                tool,
                validator,
                danger,
            },
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(|e| e.tool.clone())
    }

    /// Tool schemas for the model request, sorted by name for determinism.
    pub fn tool_definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|entry| ToolDefinition {
                name: entry.tool.name().to_string(),
                description: entry.tool.description().to_string(),
                parameters: entry.tool.parameters(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Run one assembled call through the full pipeline:
    /// validate → approval id → egress flow check → approval → network
    /// guard → execute → truncate → secret scan → redact → label.
    ///
    /// Failures at any stage come back as a `ToolDispatch` with
    /// `success == false`; this function never propagates tool errors.
    pub async fn dispatch(
        &self,
        call: &AssembledToolCall,
        session_grants: &mut HashSet<String>,
        ctx: &ToolContext,
    ) -> ToolDispatch {
        let started = Instant::now();
        let error_label = ContentLabel::system("tool_gateway");

        let fail = |output: String, approved: Option<bool>, started: Instant| ToolDispatch {
            success: false,
            output,
            label: error_label.clone(),
            truncated: false,
            execution_time: started.elapsed(),
            approved,
        };

        let Some(entry) = self.tools.get(&call.name) else {
            return fail(format!("unknown tool '{}'", call.name), None, started);
        };
        let tool = &entry.tool;
        let capability = tool.capability();

        self.audit_tool(
            AuditSeverity::Info,
            "start",
            &call.name,
            ctx,
            serde_json::json!({"callId": call.id}),
        );

        // 1. Argument validation against the declared schema
        if let Err(e) = entry.validator.validate(&call.arguments) {
            return fail(
                format!("invalid arguments for {}: {}", call.name, e),
                None,
                started,
            );
        }

        // 2. Approval identifier from the validated args
        let Some(target) = tool.approval_target(&call.arguments) else {
            return fail(
                format!("{}: could not derive an approval target", call.name),
                None,
                started,
            );
        };
        let approval_id = match compute_approval_id(&call.name, tool.action(), &target) {
            Ok(id) => id,
            Err(e) => return fail(format!("{}: {}", call.name, e), None, started),
        };

        // 3. Egress flow control for network tools: the arguments are
        // model-authored, so they are gated by the combined label of
        // everything the model has read this turn. Deny closes the call
        // outright; ask downgrades to an approval requirement.
        let mut flow_requires_approval = false;
        if capability.network_policy.is_some() {
            if let Some(label) = &ctx.context_label {
                match flow::decide(label, FlowDestination::NetworkEgress) {
                    FlowDecision::Deny => {
                        let reason = flow::reason(label, FlowDestination::NetworkEgress);
                        self.audit_tool(
                            AuditSeverity::Warning,
                            "egress_denied",
                            &call.name,
                            ctx,
                            serde_json::json!({"reason": reason.clone()}),
                        );
                        return fail(reason, None, started);
                    }
                    FlowDecision::Ask => flow_requires_approval = true,
                    FlowDecision::Allow => {}
                }
            }
        }

        // 4. Approval resolution. The tool's own analysis (quote-aware for
        // shell commands) decides danger; tools without one fall back to
        // the capability's patterns over the raw target.
        let is_dangerous = tool
            .analyze_danger(&target)
            .unwrap_or_else(|| entry.danger.iter().any(|re| re.is_match(&target)));
        let method = tool.request_method(&call.arguments);
        let method_needs_approval = method.as_ref().is_some_and(|m| {
            capability
                .methods_requiring_approval
                .iter()
                .any(|required| required.eq_ignore_ascii_case(m))
        });
        let needs_approval = capability.approval == ApprovalPolicy::Ask
            || is_dangerous
            || method_needs_approval
            || flow_requires_approval;

        let mut approved = None;
        if needs_approval {
            let request = ApprovalRequest {
                approval_id: approval_id.clone(),
                tool: call.name.clone(),
                action: tool.action().to_string(),
                target: target.clone(),
                is_dangerous,
            };
            let outcome = self.approvals.resolve(request, session_grants).await;
            match outcome {
                ApprovalOutcome::Denied(reason) => {
                    self.audit_tool(
                        AuditSeverity::Warning,
                        "approval_denied",
                        &call.name,
                        ctx,
                        serde_json::json!({"approvalId": approval_id, "reason": reason}),
                    );
                    return fail("denied".to_string(), Some(false), started);
                }
                ApprovalOutcome::AlreadyGranted | ApprovalOutcome::Granted(_) => {
                    approved = Some(true);
                    self.audit_tool(
                        AuditSeverity::Info,
                        "approval_granted",
                        &call.name,
                        ctx,
                        serde_json::json!({"approvalId": approval_id}),
                    );
                }
            }
        }

        // 5. Network guard for network-outbound tools
        if let Some(policy) = &capability.network_policy {
            let method = method.as_deref().unwrap_or("GET");
            let check = self.guard.check_url(&target, method, Some(policy)).await;
            if !check.allowed {
                let reason = check
                    .reason
                    .unwrap_or_else(|| "request blocked".to_string());
                self.audit_tool(
                    AuditSeverity::Warning,
                    "url_blocked",
                    &call.name,
                    ctx,
                    serde_json::json!({"reason": reason}),
                );
                return fail(reason, approved, started);
            }
        }

        // 6. Execute with timeout and panic isolation
        let raw = {
            let tool = tool.clone();
            let args = call.arguments.clone();
            let exec_ctx = ctx.clone();
            let timeout = capability.timeout;
            let tool_name = call.name.clone();
            let handle = tokio::task::spawn(async move {
                tokio::time::timeout(timeout, tool.execute(args, &exec_ctx)).await
            });
            match handle.await {
                Ok(Ok(Ok(output))) => output,
                Ok(Ok(Err(e))) => {
                    warn!("tool '{}' failed: {}", tool_name, e);
                    crate::agent::tools::base::ToolOutput::fail(format!(
                        "tool execution failed: {}",
                        e
                    ))
                }
                Ok(Err(_)) => {
                    warn!(
                        "tool '{}' timed out after {}s",
                        tool_name,
                        capability.timeout.as_secs()
                    );
                    crate::agent::tools::base::ToolOutput::fail(format!(
                        "tool timed out after {}s",
                        capability.timeout.as_secs()
                    ))
                }
                Err(join_err) if join_err.is_panic() => {
                    error!("tool '{}' panicked: {:?}", tool_name, join_err);
                    crate::agent::tools::base::ToolOutput::fail(
                        "tool crashed unexpectedly".to_string(),
                    )
                }
                Err(_) => {
                    crate::agent::tools::base::ToolOutput::fail("tool was cancelled".to_string())
                }
            }
        };

        // 7. Post-processing: cap → scan → redact → label
        let cap = self
            .output_caps
            .get(&call.name)
            .copied()
            .unwrap_or(capability.output_cap);
        let (capped, truncated) = cap_output(&raw.output, cap);

        let findings = self.detector.scan(&capped);
        let redacted_any = findings
            .iter()
            .any(|f| f.confidence >= Confidence::Probable);
        let output = if redacted_any {
            self.detector.redact_default(&capped)
        } else {
            capped
        };

        let mut label = ContentLabel::new(
            capability.output_trust,
            capability.output_class,
            tool.name(),
        )
        .with_origin_id(&target);
        match SecretDetector::max_confidence(&findings) {
            Some(Confidence::Definite) => label = label.elevate(DataClass::Secret),
            Some(Confidence::Probable) => label = label.elevate(DataClass::Sensitive),
            _ => {}
        }

        let summary = SecretDetector::summarize(&findings);
        self.audit_tool(
            if raw.success {
                AuditSeverity::Info
            } else {
                AuditSeverity::Warning
            },
            "complete",
            &call.name,
            ctx,
            serde_json::json!({
                "callId": call.id,
                "success": raw.success,
                "durationMs": started.elapsed().as_millis() as u64,
                "truncated": truncated,
                "secretsFound": summary,
            }),
        );

        ToolDispatch {
            success: raw.success,
            output,
            label,
            truncated,
            execution_time: started.elapsed(),
            approved,
        }
    }

    fn audit_tool(
        &self,
        severity: AuditSeverity,
        action: &str,
        tool: &str,
        ctx: &ToolContext,
        metadata: serde_json::Value,
    ) {
        let category = if action.starts_with("approval") {
            AuditCategory::Approval
        } else if action == "url_blocked" || action == "egress_denied" {
            AuditCategory::Network
        } else {
            AuditCategory::Tool
        };
        let mut event = AuditEvent::new(category, action, severity)
            .session(&ctx.session_id)
            .meta("tool", tool);
        if let serde_json::Value::Object(map) = metadata {
            for (key, value) in map {
                event = event.meta(&key, value);
            }
        }
        if let Err(e) = self.audit.log(event) {
            warn!("audit write failed: {}", e);
        }
    }
}

/// Truncate at the byte cap on a UTF-8 boundary.
fn cap_output(output: &str, cap: usize) -> (String, bool) {
    if output.len() <= cap {
        return (output.to_string(), false);
    }
    let bytes = crate::utils::truncate_at_utf8_boundary(output.as_bytes(), cap);
    (
        String::from_utf8_lossy(bytes).into_owned(),
        true,
    )
}

#[cfg(test)]
mod tests;
