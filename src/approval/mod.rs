//! Approval manager: canonical approval identifiers, grant scopes, and the
//! interactive prompt path.

use crate::utils::atomic_write;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tracing::{info, warn};

const MAX_TARGET_CHARS: usize = 200;

/// How long a grant lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalScope {
    Once,
    Session,
    Always,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalGrant {
    pub approval_id: String,
    pub scope: ApprovalScope,
    pub granted_at: DateTime<Utc>,
}

/// What the prompt surface shows the user.
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub approval_id: String,
    pub tool: String,
    pub action: String,
    pub target: String,
    /// Dangerous operations MUST be displayed distinctly by the surface.
    pub is_dangerous: bool,
}

/// The user's answer, including how long to remember it.
#[derive(Debug, Clone, Copy)]
pub struct ApprovalDecision {
    pub approved: bool,
    pub remember: ApprovalScope,
}

/// Outcome of resolving an approval for one tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalOutcome {
    /// Covered by an existing grant; no prompt shown.
    AlreadyGranted,
    /// The user approved interactively with the given scope.
    Granted(ApprovalScope),
    Denied(String),
}

impl ApprovalOutcome {
    pub fn is_granted(&self) -> bool {
        !matches!(self, ApprovalOutcome::Denied(_))
    }
}

/// Callback presenting an approval request on some surface (CLI stdin,
/// WebSocket round-trip, inline keyboard). `None` means the surface could
/// not produce a decision, which is treated as denial.
pub type ApprovalPrompt =
    Box<dyn Fn(ApprovalRequest) -> BoxFuture<'static, Option<ApprovalDecision>> + Send + Sync>;

/// Compute the canonical `tool:action:normalizedTarget` identifier.
///
/// URL targets normalize to `lowercase(host) + path + sorted query` with the
/// fragment dropped and a trailing slash stripped (root `/` preserved).
/// Other targets are trimmed, lowercased, and truncated at 200 chars with an
/// 8-hex SHA-256 suffix so distinct long commands never collide.
///
/// An empty target is a hard error: an approval must always name what it
/// approves.
pub fn compute_approval_id(tool: &str, action: &str, target: &str) -> Result<String> {
    let trimmed = target.trim();
    if trimmed.is_empty() {
        bail!("approval target must not be empty (tool={}, action={})", tool, action);
    }
    let normalized = if let Ok(url) = url::Url::parse(trimmed) {
        if matches!(url.scheme(), "http" | "https") {
            normalize_url_target(&url)
        } else {
            normalize_string_target(trimmed)
        }
    } else {
        normalize_string_target(trimmed)
    };
    Ok(format!("{}:{}:{}", tool, action, normalized))
}

/// The explicit wildcard form covering every target of a tool.
pub fn wildcard_approval_id(tool: &str) -> String {
    format!("{}:*", tool)
}

fn normalize_url_target(url: &url::Url) -> String {
    let host = url.host_str().unwrap_or("").to_ascii_lowercase();
    let mut out = host;
    if let Some(port) = url.port() {
        let _ = write!(out, ":{}", port);
    }

    let path = url.path();
    if path == "/" || path.is_empty() {
        out.push('/');
    } else if let Some(stripped) = path.strip_suffix('/') {
        out.push_str(stripped);
    } else {
        out.push_str(path);
    }

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if !pairs.is_empty() {
        pairs.sort();
        let query: Vec<String> = pairs
            .into_iter()
            .map(|(k, v)| if v.is_empty() { k } else { format!("{}={}", k, v) })
            .collect();
        let _ = write!(out, "?{}", query.join("&"));
    }
    // Fragment intentionally dropped
    out
}

fn normalize_string_target(target: &str) -> String {
    let lowered = target.trim().to_ascii_lowercase();
    if lowered.chars().count() <= MAX_TARGET_CHARS {
        return lowered;
    }
    let truncated: String = lowered.chars().take(MAX_TARGET_CHARS).collect();
    let digest = Sha256::digest(lowered.as_bytes());
    format!("{}#{}", truncated, hex::encode(&digest[..4]))
}

/// Stores grants and serializes interactive prompts. The `always` set is
/// shared process-wide and guarded; `session` grants live on the session.
pub struct ApprovalManager {
    timeout: Duration,
    always: StdMutex<HashSet<String>>,
    persist_path: Option<PathBuf>,
    // tokio Mutex: held across the await on the prompt surface so approval
    // dialogs never interleave
    prompt: tokio::sync::Mutex<Option<ApprovalPrompt>>,
}

impl ApprovalManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            always: StdMutex::new(HashSet::new()),
            persist_path: None,
            prompt: tokio::sync::Mutex::new(None),
        }
    }

    /// Load the persistent `always` list from `path` (created on first grant).
    pub fn with_persistence(timeout: Duration, path: PathBuf) -> Result<Self> {
        let mut always = HashSet::new();
        if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read approvals from {}", path.display()))?;
            let grants: Vec<ApprovalGrant> =
                serde_json::from_str(&content).context("Failed to parse approvals file")?;
            always.extend(grants.into_iter().map(|g| g.approval_id));
        }
        Ok(Self {
            timeout,
            always: StdMutex::new(always),
            persist_path: Some(path),
            prompt: tokio::sync::Mutex::new(None),
        })
    }

    pub async fn set_prompt(&self, prompt: ApprovalPrompt) {
        *self.prompt.lock().await = Some(prompt);
    }

    /// Resolve an approval: existing grants first, then the interactive
    /// prompt. Timeout and missing surface both resolve to denial.
    pub async fn resolve(
        &self,
        request: ApprovalRequest,
        session_grants: &mut HashSet<String>,
    ) -> ApprovalOutcome {
        let wildcard = wildcard_approval_id(&request.tool);
        {
            let always = self.always.lock().expect("approval lock poisoned");
            if always.contains(&request.approval_id) || always.contains(&wildcard) {
                return ApprovalOutcome::AlreadyGranted;
            }
        }
        if session_grants.contains(&request.approval_id) || session_grants.contains(&wildcard) {
            return ApprovalOutcome::AlreadyGranted;
        }

        let guard = self.prompt.lock().await;
        let Some(prompt) = guard.as_ref() else {
            return ApprovalOutcome::Denied("no approval surface registered".to_string());
        };

        let decision =
            match tokio::time::timeout(self.timeout, prompt(request.clone())).await {
                Ok(Some(decision)) => decision,
                Ok(None) => {
                    return ApprovalOutcome::Denied("approval prompt unavailable".to_string())
                }
                Err(_) => {
                    warn!(
                        "approval timed out after {}s: {}",
                        self.timeout.as_secs(),
                        request.approval_id
                    );
                    return ApprovalOutcome::Denied(format!(
                        "approval timed out after {}s",
                        self.timeout.as_secs()
                    ));
                }
            };

        if !decision.approved {
            return ApprovalOutcome::Denied("denied".to_string());
        }

        match decision.remember {
            ApprovalScope::Once => {}
            ApprovalScope::Session => {
                session_grants.insert(request.approval_id.clone());
            }
            ApprovalScope::Always => {
                let mut always = self.always.lock().expect("approval lock poisoned");
                always.insert(request.approval_id.clone());
                if let Err(e) = self.persist(&always) {
                    warn!("failed to persist always-approvals: {}", e);
                }
            }
        }
        info!(
            "approval granted ({:?}): {}",
            decision.remember, request.approval_id
        );
        ApprovalOutcome::Granted(decision.remember)
    }

    fn persist(&self, always: &HashSet<String>) -> Result<()> {
        let Some(path) = &self.persist_path else {
            return Ok(());
        };
        let mut grants: Vec<ApprovalGrant> = always
            .iter()
            .map(|id| ApprovalGrant {
                approval_id: id.clone(),
                scope: ApprovalScope::Always,
                granted_at: Utc::now(),
            })
            .collect();
        grants.sort_by(|a, b| a.approval_id.cmp(&b.approval_id));
        atomic_write(path, &serde_json::to_string_pretty(&grants)?)
    }

    /// Grant an id directly (used by the CLI `always allow` flow and tests).
    pub fn grant_always(&self, approval_id: &str) {
        let mut always = self.always.lock().expect("approval lock poisoned");
        always.insert(approval_id.to_string());
        if let Err(e) = self.persist(&always) {
            warn!("failed to persist always-approvals: {}", e);
        }
    }
}

#[cfg(test)]
mod tests;
