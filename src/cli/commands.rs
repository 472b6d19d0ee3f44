use crate::agent::{Orchestrator, OrchestratorConfig};
use crate::audit::AuditQuery;
use crate::channel::cli::CliChannel;
use crate::channel::Channel;
use crate::cli::runtime::{build, stdin_approval_prompt, Runtime};
use crate::errors::MeaoError;
use crate::providers::anthropic::AnthropicProvider;
use crate::providers::base::{ModelProvider, RetryConfig};
use crate::session::{Session, SessionStore};
use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

pub async fn list_sessions() -> Result<()> {
    let runtime = build(None, None)?;
    let sessions = runtime.sessions.list().await?;
    if sessions.is_empty() {
        println!("no stored sessions");
        return Ok(());
    }
    for summary in sessions {
        println!(
            "{}  updated {}  {} messages",
            summary.id,
            summary.updated_at.format("%Y-%m-%d %H:%M"),
            summary.message_count
        );
    }
    Ok(())
}

pub async fn interactive(
    model: Option<String>,
    work_dir: Option<PathBuf>,
    resume: Option<String>,
) -> Result<()> {
    let runtime = build(model, work_dir)?;
    if runtime.config.provider.api_key.is_empty() {
        bail!(
            "no API key configured: set MEAO_ANTHROPIC_API_KEY or add it to credentials.json"
        );
    }

    let session = match resume {
        Some(id) => runtime
            .sessions
            .get(&id)
            .await?
            .with_context(|| format!("no session with id {}", id))?,
        None => runtime.sessions.create().await?,
    };
    println!("meao {} — session {}", crate::VERSION, session.id);
    println!("type /help for commands");

    runtime.approvals.set_prompt(stdin_approval_prompt()).await;

    let provider: Arc<dyn ModelProvider> = Arc::new(AnthropicProvider::new(
        runtime.config.provider.api_key.clone(),
        Some(runtime.config.provider.model.clone()),
    ));
    let orchestrator = build_orchestrator(&runtime, provider, session);
    orchestrator.start();

    repl(&runtime, &orchestrator).await?;

    orchestrator.stop();
    Ok(())
}

pub fn build_orchestrator(
    runtime: &Runtime,
    provider: Arc<dyn ModelProvider>,
    session: Session,
) -> Arc<Orchestrator> {
    let channel: Arc<dyn Channel> = Arc::new(CliChannel::new(session.id.clone()));
    build_orchestrator_with(runtime, provider, session, &channel)
}

pub fn build_orchestrator_with(
    runtime: &Runtime,
    provider: Arc<dyn ModelProvider>,
    session: Session,
    channel: &Arc<dyn Channel>,
) -> Arc<Orchestrator> {
    let config = OrchestratorConfig {
        max_tool_calls_per_turn: runtime.config.agent.max_tool_calls_per_turn,
        max_messages: runtime.config.session.max_messages,
        model: Some(runtime.config.provider.model.clone()),
        max_tokens: runtime.config.provider.max_tokens,
        temperature: runtime.config.provider.temperature,
        model_cost: runtime.config.model_cost(&runtime.config.provider.model),
        work_dir: runtime.work_dir.clone(),
        user_id: whoami(),
        retry: RetryConfig {
            max_retries: runtime.config.provider.max_retries,
            ..RetryConfig::default()
        },
        ..OrchestratorConfig::default()
    };
    Arc::new(Orchestrator::new(
        provider,
        runtime.gateway.clone(),
        runtime.sessions.clone(),
        channel,
        runtime.audit.clone(),
        runtime.detector.clone(),
        config,
        session,
    ))
}

async fn repl(runtime: &Runtime, orchestrator: &Arc<Orchestrator>) -> Result<()> {
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    loop {
        print_prompt();
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                println!("\ninterrupted — session saved");
                return Ok(());
            }
        };
        let Some(line) = line else { break };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        match input {
            "/quit" | "/exit" => break,
            "/help" => {
                println!("/help     show this help");
                println!("/session  usage and cost for this session");
                println!("/clear    drop conversation history");
                println!("/audit    recent audit entries");
                println!("/quit     exit (also /exit)");
                continue;
            }
            "/session" => {
                let snapshot = orchestrator.session_snapshot().await;
                println!(
                    "session {}: {} turns, {} messages",
                    snapshot.id,
                    snapshot.turns.len(),
                    snapshot.messages.len()
                );
                println!(
                    "tokens: {} in / {} out, estimated cost ${:.4}",
                    snapshot.total_usage.input_tokens,
                    snapshot.total_usage.output_tokens,
                    snapshot.estimated_cost
                );
                continue;
            }
            "/clear" => {
                orchestrator.clear_history().await;
                println!("history cleared (starts fresh next turn)");
                continue;
            }
            "/audit" => {
                let entries = runtime.audit.query(&AuditQuery::default())?;
                for entry in entries.iter().rev().take(20).rev() {
                    println!(
                        "{} [{:?}/{:?}] {}",
                        entry.timestamp.format("%H:%M:%S"),
                        entry.category,
                        entry.severity,
                        entry.action
                    );
                }
                continue;
            }
            _ => {}
        }

        match orchestrator.process_message(input).await {
            Ok(_) => {}
            Err(e) if e.is_turn_fatal() => {
                eprintln!("fatal: {}", e);
                if matches!(e, MeaoError::Auth(_)) {
                    bail!("authentication failed — check your credentials");
                }
            }
            Err(e) => eprintln!("turn failed: {}", e),
        }
    }
    Ok(())
}

fn print_prompt() {
    use std::io::Write;
    let mut out = std::io::stdout();
    let _ = out.write_all(b"\n> ");
    let _ = out.flush();
}

fn whoami() -> String {
    std::env::var("USER").unwrap_or_else(|_| "local".to_string())
}
