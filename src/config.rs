use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::oracle::Backend;
use crate::sandbox::{NetworkPolicy, SessionLimits};

pub(crate) const CONFIG_FILE: &str = "fixloop.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub oracle: OracleConfig,
}

/// Control loop budgets and backend selection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Decision backend: "hosted", "claude-cli", "codex-cli" or "noop"
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Maximum oracle turns per task
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Wall-clock budget per task, in seconds
    #[serde(default = "default_agent_timeout")]
    pub agent_timeout_secs: u64,

    /// Total token budget per task (0 = unlimited)
    #[serde(default)]
    pub max_token_budget: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            max_iterations: default_max_iterations(),
            agent_timeout_secs: default_agent_timeout(),
            max_token_budget: 0,
        }
    }
}

impl AgentConfig {
    /// Parse the backend string into a Backend enum
    pub fn get_backend(&self) -> Result<Backend> {
        self.backend.parse()
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_secs)
    }
}

/// Where task environments come from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SandboxRuntime {
    /// One container per task
    #[default]
    Docker,
    /// A host directory per task, no isolation
    Local,
}

impl std::fmt::Display for SandboxRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Docker => write!(f, "docker"),
            Self::Local => write!(f, "local"),
        }
    }
}

impl std::str::FromStr for SandboxRuntime {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "docker" => Ok(Self::Docker),
            "local" => Ok(Self::Local),
            _ => anyhow::bail!("Unknown sandbox runtime: '{s}'. Supported: docker, local"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Runtime that provides task environments
    #[serde(default)]
    pub runtime: SandboxRuntime,

    /// Image name template; `{task_id}` is replaced per task
    #[serde(default = "default_image")]
    pub image: String,

    /// Working directory inside the container
    #[serde(default = "default_workdir")]
    pub workdir: String,

    /// User to run as inside the container (image default if unset)
    #[serde(default)]
    pub user: Option<String>,

    /// Default per-command timeout, in seconds
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Hard ceiling on any per-command timeout, in seconds
    #[serde(default = "default_max_command_timeout")]
    pub max_command_timeout_secs: u64,

    /// Additional volume mounts
    #[serde(default)]
    pub mounts: Vec<Mount>,

    /// Network policy
    #[serde(default)]
    pub network: NetworkPolicy,

    /// Resource limits
    #[serde(default)]
    pub resources: ResourceConfig,

    /// Parent directory of per-task checkouts for the local runtime
    #[serde(default = "default_local_root")]
    pub local_root: PathBuf,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            runtime: SandboxRuntime::default(),
            image: default_image(),
            workdir: default_workdir(),
            user: None,
            command_timeout_secs: default_command_timeout(),
            max_command_timeout_secs: default_max_command_timeout(),
            mounts: Vec::new(),
            network: NetworkPolicy::default(),
            resources: ResourceConfig::default(),
            local_root: default_local_root(),
        }
    }
}

impl SandboxConfig {
    /// Per-session timeout policy derived from this config
    pub fn limits(&self) -> SessionLimits {
        SessionLimits::new(
            Duration::from_secs(self.command_timeout_secs),
            Duration::from_secs(self.max_command_timeout_secs),
        )
    }

    /// Image for a task, from the template
    pub fn image_for(&self, task_id: &str) -> String {
        self.image.replace("{task_id}", &task_id.to_lowercase())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mount {
    pub host: String,
    pub container: String,
    #[serde(default = "default_true")]
    pub readonly: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Memory limit (e.g., "8g")
    #[serde(default = "default_memory")]
    pub memory: String,

    /// CPU limit (e.g., "4")
    #[serde(default = "default_cpus")]
    pub cpus: String,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            memory: default_memory(),
            cpus: default_cpus(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Tasks processed concurrently
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Root for results.jsonl and per-run logs
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            output_dir: default_output_dir(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OracleConfig {
    #[serde(default)]
    pub hosted: HostedConfig,
    #[serde(default)]
    pub claude: ClaudeCliConfig,
    #[serde(default)]
    pub codex: CodexCliConfig,
}

/// Hosted chat API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostedConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Environment variable holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_hosted_model")]
    pub model: String,

    /// Max tokens per response
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// USD per million input tokens
    #[serde(default = "default_input_price")]
    pub input_price_per_mtok: f64,

    /// USD per million output tokens
    #[serde(default = "default_output_price")]
    pub output_price_per_mtok: f64,

    /// Per-request timeout, in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Retries for rate limits and server errors
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial retry delay, doubled after each attempt
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
}

impl Default for HostedConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            model: default_hosted_model(),
            max_tokens: default_max_tokens(),
            input_price_per_mtok: default_input_price(),
            output_price_per_mtok: default_output_price(),
            request_timeout_secs: default_request_timeout(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay(),
        }
    }
}

/// Claude Code CLI configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeCliConfig {
    /// Path to the Claude CLI
    #[serde(default = "default_claude_path")]
    pub path: String,

    /// Model alias passed with --model
    #[serde(default = "default_claude_model")]
    pub model: String,

    /// Dollar cap passed with --max-budget-usd
    #[serde(default = "default_max_budget_usd")]
    pub max_budget_usd: f64,
}

impl Default for ClaudeCliConfig {
    fn default() -> Self {
        Self {
            path: default_claude_path(),
            model: default_claude_model(),
            max_budget_usd: default_max_budget_usd(),
        }
    }
}

/// Codex CLI configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodexCliConfig {
    /// Path to the Codex CLI
    #[serde(default = "default_codex_path")]
    pub path: String,

    /// Model passed with --model (Codex default if unset)
    #[serde(default)]
    pub model: Option<String>,
}

impl Default for CodexCliConfig {
    fn default() -> Self {
        Self {
            path: default_codex_path(),
            model: None,
        }
    }
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_backend() -> String {
    "hosted".to_string()
}

fn default_max_iterations() -> u32 {
    30
}

fn default_agent_timeout() -> u64 {
    1800
}

fn default_image() -> String {
    "sweb.eval.x86_64.{task_id}:latest".to_string()
}

fn default_workdir() -> String {
    "/testbed".to_string()
}

fn default_command_timeout() -> u64 {
    120
}

fn default_max_command_timeout() -> u64 {
    600
}

fn default_local_root() -> PathBuf {
    PathBuf::from("repos")
}

fn default_memory() -> String {
    "8g".to_string()
}

fn default_cpus() -> String {
    "4".to_string()
}

fn default_max_workers() -> usize {
    1
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("runs")
}

fn default_base_url() -> String {
    "https://api.anthropic.com".to_string()
}

fn default_api_key_env() -> String {
    "ANTHROPIC_API_KEY".to_string()
}

fn default_hosted_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_input_price() -> f64 {
    3.0
}

fn default_output_price() -> f64 {
    15.0
}

fn default_request_timeout() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_delay() -> u64 {
    1000
}

fn default_claude_path() -> String {
    "claude".to_string()
}

fn default_claude_model() -> String {
    "sonnet".to_string()
}

fn default_max_budget_usd() -> f64 {
    1.0
}

fn default_codex_path() -> String {
    "codex".to_string()
}

impl Config {
    /// Load configuration from file, using defaults if not found
    pub fn load(project_dir: &Path) -> Result<Self> {
        Self::load_file(&project_dir.join(CONFIG_FILE))
    }

    /// Load configuration from an explicit path, using defaults if not found
    pub fn load_file(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        Ok(config)
    }
}
