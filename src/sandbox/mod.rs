//! Tiered sandbox for shell execution: direct, scrubbed process with
//! resource limits, or container with no network.

use crate::audit::{AuditCategory, AuditEvent, AuditLogger, AuditSeverity};
use crate::config::{SandboxConfig, SandboxTier};
use crate::utils::truncate_at_utf8_boundary;
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::warn;

/// Maximum combined stdout+stderr size captured by the executor. Per-tool
/// output caps are applied later by the gateway.
const MAX_OUTPUT_BYTES: usize = 1024 * 1024; // 1 MB

/// Environment variables safe to pass through to sandboxed children.
const ALLOWED_ENV_VARS: &[&str] = &["PATH", "HOME", "USER", "LANG"];

/// Result of one sandboxed execution.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub truncated: bool,
    pub timed_out: bool,
    pub execution_time: Duration,
}

// Container runtime probe state: 0 unknown, 1 available, 2 unavailable
const RUNTIME_UNKNOWN: u8 = 0;
const RUNTIME_OK: u8 = 1;
const RUNTIME_MISSING: u8 = 2;

/// Executes shell commands at the configured isolation tier.
pub struct SandboxExecutor {
    config: SandboxConfig,
    audit: Arc<AuditLogger>,
    runtime_state: AtomicU8,
}

impl SandboxExecutor {
    pub fn new(config: SandboxConfig, audit: Arc<AuditLogger>) -> Self {
        Self {
            config,
            audit,
            runtime_state: AtomicU8::new(RUNTIME_UNKNOWN),
        }
    }

    pub fn tier(&self) -> SandboxTier {
        self.config.tier
    }

    /// Run `command` through `sh -c` at the given tier with a wall-clock
    /// timeout. On timeout the child is killed (SIGKILL / container kill)
    /// and `timed_out` is set.
    pub async fn execute(
        &self,
        command: &str,
        tool_name: &str,
        work_dir: &Path,
        timeout: Duration,
    ) -> Result<ExecOutcome> {
        let tier = self.effective_tier(tool_name).await;
        let mut cmd = match tier {
            SandboxTier::None => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(command);
                cmd
            }
            SandboxTier::Process => {
                let mut cmd = self.scrubbed_command("sh");
                cmd.arg("-c").arg(command);
                apply_rlimits(&mut cmd, &self.config);
                cmd
            }
            SandboxTier::Container => self.container_command(command, work_dir),
        };

        if tier != SandboxTier::Container {
            cmd.current_dir(work_dir);
        }
        // Timeout/cancellation path: dropping the future sends SIGKILL
        cmd.kill_on_drop(true);

        let started = Instant::now();
        match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(Ok(output)) => {
                let execution_time = started.elapsed();
                let combined_len = output.stdout.len() + output.stderr.len();
                let truncated = combined_len > MAX_OUTPUT_BYTES;

                // Truncate raw bytes before UTF-8 conversion to bound memory.
                // Reserve at least 25% for stderr so error messages aren't lost.
                let stderr_reserve = MAX_OUTPUT_BYTES / 4;
                let stdout_max = MAX_OUTPUT_BYTES - stderr_reserve.min(output.stderr.len());
                let stdout_bytes = if output.stdout.len() > stdout_max {
                    truncate_at_utf8_boundary(&output.stdout, stdout_max)
                } else {
                    &output.stdout
                };
                let remaining = MAX_OUTPUT_BYTES.saturating_sub(stdout_bytes.len());
                let stderr_bytes = if output.stderr.len() > remaining {
                    truncate_at_utf8_boundary(&output.stderr, remaining)
                } else {
                    &output.stderr
                };

                Ok(ExecOutcome {
                    exit_code: output.status.code().unwrap_or(-1),
                    stdout: String::from_utf8_lossy(stdout_bytes).into_owned(),
                    stderr: String::from_utf8_lossy(stderr_bytes).into_owned(),
                    truncated,
                    timed_out: false,
                    execution_time,
                })
            }
            Ok(Err(e)) => Err(e).context("Failed to spawn sandboxed command"),
            Err(_) => Ok(ExecOutcome {
                exit_code: -1,
                stdout: String::new(),
                stderr: format!("command timed out after {} seconds", timeout.as_secs()),
                truncated: false,
                timed_out: true,
                execution_time: started.elapsed(),
            }),
        }
    }

    /// Resolve the configured tier, falling back from container to process
    /// when the runtime is unavailable (with an audit warning).
    async fn effective_tier(&self, tool_name: &str) -> SandboxTier {
        if self.config.tier != SandboxTier::Container {
            return self.config.tier;
        }
        if self.container_runtime_available().await {
            return SandboxTier::Container;
        }
        warn!(
            "container runtime '{}' unavailable, falling back to process tier",
            self.config.container_runtime
        );
        let _ = self.audit.log(
            AuditEvent::new(
                AuditCategory::Sandbox,
                "container_fallback",
                AuditSeverity::Warning,
            )
            .meta("tool", tool_name)
            .meta("runtime", self.config.container_runtime.clone()),
        );
        SandboxTier::Process
    }

    async fn container_runtime_available(&self) -> bool {
        match self.runtime_state.load(Ordering::Relaxed) {
            RUNTIME_OK => return true,
            RUNTIME_MISSING => return false,
            _ => {}
        }
        let probe = Command::new(&self.config.container_runtime)
            .arg("version")
            .arg("--format")
            .arg("{{.Server.Version}}")
            .output()
            .await;
        let available = matches!(probe, Ok(out) if out.status.success());
        self.runtime_state.store(
            if available { RUNTIME_OK } else { RUNTIME_MISSING },
            Ordering::Relaxed,
        );
        available
    }

    /// Create a `Command` with a scrubbed environment: `env_clear()` plus the
    /// allowlisted variables and configured extras. Prevents leakage of API
    /// keys and tokens to child processes.
    fn scrubbed_command(&self, program: &str) -> Command {
        let mut cmd = Command::new(program);
        cmd.env_clear();
        for var in ALLOWED_ENV_VARS
            .iter()
            .copied()
            .chain(self.config.extra_env.iter().map(String::as_str))
        {
            if let Ok(val) = std::env::var(var) {
                cmd.env(var, val);
            }
        }
        cmd
    }

    /// Baseline container hardening: no network, read-only root, all caps
    /// dropped, non-root user, no privilege escalation, tmpfs /tmp, resource
    /// limits, workdir mounted at /workspace.
    fn container_command(&self, command: &str, work_dir: &Path) -> Command {
        let mut cmd = Command::new(&self.config.container_runtime);
        cmd.arg("run")
            .arg("--rm")
            .arg("--network=none")
            .arg("--read-only")
            .arg("--cap-drop=ALL")
            .arg("--security-opt")
            .arg("no-new-privileges")
            .arg("--user")
            .arg("1000:1000")
            .arg("--tmpfs")
            .arg("/tmp")
            .arg(format!("--memory={}m", self.config.memory_limit_mb))
            .arg(format!("--cpus={}", self.config.cpu_limit))
            .arg(format!("--pids-limit={}", self.config.pid_limit))
            .arg("-v")
            .arg(format!("{}:/workspace", work_dir.display()))
            .arg("-w")
            .arg("/workspace")
            .arg(&self.config.container_image)
            .arg("sh")
            .arg("-c")
            .arg(command);
        cmd
    }
}

/// Apply CPU-seconds and address-space rlimits in the child between fork and
/// exec. RLIMIT_NPROC is deliberately not set here: it is a per-user limit,
/// so a hard cap would throttle unrelated processes of the same uid. Process
/// counts are bounded at the container tier via --pids-limit.
#[cfg(unix)]
fn apply_rlimits(cmd: &mut Command, config: &SandboxConfig) {
    let cpu_secs = config.cpu_time_secs;
    let memory_bytes = config.memory_limit_mb.saturating_mul(1024 * 1024);

    fn limit(value: u64) -> libc::rlimit {
        libc::rlimit {
            rlim_cur: value,
            rlim_max: value,
        }
    }

    // SAFETY: pre_exec runs between fork() and exec() in the child.
    // setrlimit is async-signal-safe; no allocation happens here.
    // Calls are best-effort: unsupported resources are ignored.
    unsafe {
        cmd.pre_exec(move || {
            if cpu_secs > 0 {
                libc::setrlimit(libc::RLIMIT_CPU, &limit(cpu_secs));
            }
            if memory_bytes > 0 {
                libc::setrlimit(libc::RLIMIT_AS, &limit(memory_bytes));
            }
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn apply_rlimits(_cmd: &mut Command, _config: &SandboxConfig) {}
