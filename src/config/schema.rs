use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Top-level configuration, persisted as `config.json` in the meao home
/// directory. Every section has serde defaults so a partial (or absent)
/// config file is always valid.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub provider: ProviderConfig,
    pub agent: AgentConfig,
    pub tools: ToolsConfig,
    pub sandbox: SandboxConfig,
    pub network: NetworkConfig,
    pub approval: ApprovalConfig,
    pub audit: AuditConfig,
    pub session: SessionConfig,
    pub memory: MemoryConfig,
    /// Per-model token rates for cost estimation, keyed by model name.
    pub costs: HashMap<String, ModelCost>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProviderConfig {
    /// API key; normally supplied via credentials.json or MEAO_ANTHROPIC_API_KEY.
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub max_retries: usize,
    pub request_timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: "claude-sonnet-4-5-20250929".to_string(),
            base_url: "https://api.anthropic.com/v1/messages".to_string(),
            max_tokens: 4096,
            temperature: 0.7,
            max_retries: 3,
            request_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AgentConfig {
    /// Hard bound on tool invocations within a single turn.
    pub max_tool_calls_per_turn: usize,
    /// Working directory for file and shell tools. `~` expands to home.
    pub work_dir: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_tool_calls_per_turn: 25,
            work_dir: "~/meao-workspace".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ToolsConfig {
    /// Wall-clock timeout for the bash tool, seconds.
    pub bash_timeout_secs: u64,
    /// Wall-clock timeout for web_fetch, seconds.
    pub fetch_timeout_secs: u64,
    /// Output caps in bytes, keyed by tool name. Missing entries use
    /// built-in defaults (web_fetch 50 KB, bash 100 KB, read_file 200 KB).
    pub output_caps: HashMap<String, usize>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            bash_timeout_secs: 120,
            fetch_timeout_secs: 30,
            output_caps: HashMap::new(),
        }
    }
}

/// Isolation tier for sandboxed execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxTier {
    /// Direct child process. Trusted internal use only.
    None,
    /// Child process with scrubbed environment and resource limits.
    Process,
    /// Container runtime with no network and read-only root.
    Container,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SandboxConfig {
    pub tier: SandboxTier,
    /// Extra environment variables passed through to sandboxed processes,
    /// on top of the built-in allowlist (PATH, HOME, USER, LANG).
    pub extra_env: Vec<String>,
    pub container_image: String,
    /// Container runtime binary (docker or podman).
    pub container_runtime: String,
    pub memory_limit_mb: u64,
    pub cpu_limit: f32,
    pub pid_limit: u32,
    /// CPU seconds granted to process-tier children (rlimit).
    pub cpu_time_secs: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            tier: SandboxTier::Process,
            extra_env: Vec::new(),
            container_image: "debian:bookworm-slim".to_string(),
            container_runtime: "docker".to_string(),
            memory_limit_mb: 512,
            cpu_limit: 1.0,
            pid_limit: 256,
            cpu_time_secs: 120,
        }
    }
}

/// One allowlist entry for the network guard.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NetworkRule {
    /// Exact host or `*.suffix` wildcard (also matches the bare base domain).
    pub host: String,
    /// When present, only these methods are allowed (GET is always allowed).
    pub methods: Option<Vec<String>>,
}

impl Default for NetworkRule {
    fn default() -> Self {
        Self {
            host: String::new(),
            methods: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NetworkConfig {
    pub allowlist: Vec<NetworkRule>,
    pub blocked_ports: Vec<u16>,
    pub dns_ttl_secs: u64,
    pub max_redirects: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            allowlist: vec![
                NetworkRule {
                    host: "*.githubusercontent.com".to_string(),
                    methods: None,
                },
                NetworkRule {
                    host: "*.github.com".to_string(),
                    methods: None,
                },
                NetworkRule {
                    host: "*.wikipedia.org".to_string(),
                    methods: None,
                },
            ],
            blocked_ports: vec![22, 23, 25, 3389],
            dns_ttl_secs: 60,
            max_redirects: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ApprovalConfig {
    /// Seconds to wait for an interactive decision before treating it as denial.
    pub timeout_secs: u64,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self { timeout_secs: 60 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AuditConfig {
    /// Subdirectory of the meao home holding journal files.
    pub dir: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            dir: "logs/audit".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionConfig {
    pub max_messages: usize,
    pub ttl_days: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_messages: 200,
            ttl_days: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MemoryConfig {
    pub enabled: bool,
    /// SQLite database file under the meao home, for episodic memory.
    pub db_file: String,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            db_file: "memory.db".to_string(),
        }
    }
}

/// Token pricing per million tokens, used for session cost estimation.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ModelCost {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
}

impl Config {
    /// Validate invariants the type system cannot express.
    pub fn validate(&self) -> Result<(), String> {
        if self.agent.max_tool_calls_per_turn == 0 {
            return Err("agent.maxToolCallsPerTurn must be at least 1".to_string());
        }
        if self.network.dns_ttl_secs == 0 {
            return Err("network.dnsTtlSecs must be at least 1".to_string());
        }
        if !(0.0..=2.0).contains(&self.provider.temperature) {
            return Err("provider.temperature must be between 0.0 and 2.0".to_string());
        }
        for rule in &self.network.allowlist {
            if rule.host.trim().is_empty() {
                return Err("network.allowlist entries must have a non-empty host".to_string());
            }
        }
        Ok(())
    }

    /// Cost rates for a model, falling back to built-in defaults.
    pub fn model_cost(&self, model: &str) -> ModelCost {
        if let Some(cost) = self.costs.get(model) {
            return *cost;
        }
        // Sonnet-class default pricing
        ModelCost {
            input_per_mtok: 3.0,
            output_per_mtok: 15.0,
        }
    }
}
