//! Shared process bootstrap: the singletons (guard, detector, audit,
//! approvals) built once and passed into the orchestrator.

use crate::agent::tools::filesystem::{ReadFileTool, WriteFileTool};
use crate::agent::tools::shell::BashTool;
use crate::agent::tools::web::WebFetchTool;
use crate::agent::tools::ToolGateway;
use crate::approval::{ApprovalDecision, ApprovalManager, ApprovalPrompt, ApprovalScope};
use crate::audit::AuditLogger;
use crate::config::Config;
use crate::net::dns::SystemResolver;
use crate::net::NetworkGuard;
use crate::sandbox::SandboxExecutor;
use crate::security::secrets::SecretDetector;
use crate::session::SessionManager;
use crate::utils::{ensure_dir, get_meao_home};
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub struct Runtime {
    pub config: Config,
    pub detector: Arc<SecretDetector>,
    pub audit: Arc<AuditLogger>,
    pub approvals: Arc<ApprovalManager>,
    pub gateway: Arc<ToolGateway>,
    pub sessions: Arc<SessionManager>,
    pub work_dir: PathBuf,
}

const DEFAULT_FETCH_CAP: usize = 50_000;
const DEFAULT_BASH_CAP: usize = 100_000;
const DEFAULT_READ_CAP: usize = 200_000;

pub fn build(
    model_override: Option<String>,
    work_dir_override: Option<PathBuf>,
) -> Result<Runtime> {
    let mut config = crate::config::load_config(None)?;
    if let Some(model) = model_override {
        config.provider.model = model;
    }

    let home = get_meao_home()?;
    ensure_dir(&home)?;

    let work_dir = match work_dir_override {
        Some(dir) => dir,
        None => expand_home(&config.agent.work_dir),
    };
    ensure_dir(&work_dir)?;

    let mut detector = SecretDetector::new();
    // Credential values are always redacted from outbound text, in any encoding
    let pairs = crate::config::credentials::known_secret_pairs(&config);
    let pair_refs: Vec<(&str, &str)> = pairs
        .iter()
        .map(|(name, value)| (name.as_str(), value.as_str()))
        .collect();
    detector.add_known_secrets(&pair_refs);
    let detector = Arc::new(detector);

    let audit = Arc::new(AuditLogger::new(
        home.join(&config.audit.dir),
        detector.clone(),
    )?);

    let approvals = Arc::new(ApprovalManager::with_persistence(
        Duration::from_secs(config.approval.timeout_secs),
        home.join("approvals.json"),
    )?);

    let guard = Arc::new(NetworkGuard::new(
        config.network.clone(),
        Arc::new(SystemResolver),
    ));

    let executor = Arc::new(SandboxExecutor::new(config.sandbox.clone(), audit.clone()));

    let caps = &config.tools.output_caps;
    let fetch_cap = caps.get("web_fetch").copied().unwrap_or(DEFAULT_FETCH_CAP);
    let bash_cap = caps.get("bash").copied().unwrap_or(DEFAULT_BASH_CAP);
    let read_cap = caps.get("read_file").copied().unwrap_or(DEFAULT_READ_CAP);

    let mut gateway = ToolGateway::new(
        approvals.clone(),
        guard.clone(),
        detector.clone(),
        audit.clone(),
        config.tools.output_caps.clone(),
    );
    gateway
        .register(Arc::new(ReadFileTool::new(read_cap)))
        .context("registering read_file")?;
    gateway
        .register(Arc::new(WriteFileTool))
        .context("registering write_file")?;
    let bash = BashTool::new(
        executor.clone(),
        Duration::from_secs(config.tools.bash_timeout_secs),
        bash_cap,
    )
    .context("building bash tool")?;
    gateway
        .register(Arc::new(bash))
        .context("registering bash")?;
    gateway
        .register(Arc::new(WebFetchTool::new(
            guard.clone(),
            Duration::from_secs(config.tools.fetch_timeout_secs),
            fetch_cap,
        )))
        .context("registering web_fetch")?;
    let gateway = Arc::new(gateway);

    let sessions = Arc::new(SessionManager::new(home)?);

    Ok(Runtime {
        config,
        detector,
        audit,
        approvals,
        gateway,
        sessions,
        work_dir,
    })
}

/// Terminal approval prompt: reads one line from stdin. Runs on the blocking
/// pool; the REPL is parked awaiting the turn while this is live, so the two
/// never compete for stdin.
pub fn stdin_approval_prompt() -> ApprovalPrompt {
    Box::new(|request| {
        Box::pin(async move {
            let banner = if request.is_dangerous {
                format!(
                    "\n‼ DANGEROUS: {} wants to {} → {}\n  allow? [y]es once / [s]ession / [a]lways / [N]o: ",
                    request.tool, request.action, request.target
                )
            } else {
                format!(
                    "\n? {} wants to {} → {}\n  allow? [y]es once / [s]ession / [a]lways / [N]o: ",
                    request.tool, request.action, request.target
                )
            };
            let answer = tokio::task::spawn_blocking(move || {
                use std::io::Write;
                let mut out = std::io::stdout();
                let _ = out.write_all(banner.as_bytes());
                let _ = out.flush();
                let mut line = String::new();
                std::io::stdin().read_line(&mut line).ok()?;
                Some(line.trim().to_ascii_lowercase())
            })
            .await
            .ok()
            .flatten()?;

            let (approved, remember) = match answer.as_str() {
                "y" | "yes" => (true, ApprovalScope::Once),
                "s" | "session" => (true, ApprovalScope::Session),
                "a" | "always" => (true, ApprovalScope::Always),
                _ => (false, ApprovalScope::Once),
            };
            Some(ApprovalDecision { approved, remember })
        })
    })
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
