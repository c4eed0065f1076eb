//! Backend selection and construction.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::cli::LocalCliOracle;
use super::hosted::HostedChatOracle;
use super::noop::NoopOracle;
use super::DecisionOracle;
use crate::config::Config;

/// Supported decision backends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub(crate) enum Backend {
    /// Hosted chat API with tool calling.
    #[default]
    Hosted,
    /// Claude Code CLI, delegated.
    ClaudeCli,
    /// Codex CLI, delegated.
    CodexCli,
    /// Does nothing; pipeline smoke test.
    Noop,
}

impl Backend {
    pub const ALL: [Backend; 4] = [Self::Hosted, Self::ClaudeCli, Self::CodexCli, Self::Noop];

    pub fn description(self) -> &'static str {
        match self {
            Self::Hosted => "Anthropic Messages API with execute_command/submit_patch/give_up tools",
            Self::ClaudeCli => "Claude Code CLI driving the sandbox through docker exec",
            Self::CodexCli => "Codex CLI driving the sandbox through docker exec",
            Self::Noop => "Answers immediately; checks provisioning and persistence",
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hosted => write!(f, "hosted"),
            Self::ClaudeCli => write!(f, "claude-cli"),
            Self::CodexCli => write!(f, "codex-cli"),
            Self::Noop => write!(f, "noop"),
        }
    }
}

impl std::str::FromStr for Backend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hosted" | "api" => Ok(Self::Hosted),
            "claude-cli" | "claude" | "claude-code" => Ok(Self::ClaudeCli),
            "codex-cli" | "codex" => Ok(Self::CodexCli),
            "noop" | "dummy" => Ok(Self::Noop),
            _ => anyhow::bail!(
                "Unknown backend: '{s}'. Supported: hosted, claude-cli, codex-cli, noop"
            ),
        }
    }
}

type Factory = fn(&Config) -> Result<Arc<dyn DecisionOracle>>;

/// Maps each backend to a constructor that checks its own dependencies.
pub(crate) struct Registry {
    factories: HashMap<Backend, Factory>,
}

impl Registry {
    pub fn new() -> Self {
        let mut factories: HashMap<Backend, Factory> = HashMap::new();
        factories.insert(Backend::Hosted, create_hosted);
        factories.insert(Backend::ClaudeCli, create_claude_cli);
        factories.insert(Backend::CodexCli, create_codex_cli);
        factories.insert(Backend::Noop, create_noop);
        Self { factories }
    }

    /// Builds the oracle for `backend`, failing if its dependency is missing.
    pub fn create(&self, backend: Backend, config: &Config) -> Result<Arc<dyn DecisionOracle>> {
        let factory = self
            .factories
            .get(&backend)
            .ok_or_else(|| anyhow::anyhow!("No factory registered for backend '{backend}'"))?;
        debug!("Creating oracle for backend {}", backend);
        factory(config)
    }
}

fn create_hosted(config: &Config) -> Result<Arc<dyn DecisionOracle>> {
    let oracle = HostedChatOracle::from_env(config.oracle.hosted.clone())?;
    Ok(Arc::new(oracle))
}

fn create_claude_cli(config: &Config) -> Result<Arc<dyn DecisionOracle>> {
    let oracle = LocalCliOracle::claude(&config.oracle.claude, config.agent.agent_timeout())?;
    Ok(Arc::new(oracle))
}

fn create_codex_cli(config: &Config) -> Result<Arc<dyn DecisionOracle>> {
    let oracle = LocalCliOracle::codex(&config.oracle.codex, config.agent.agent_timeout())?;
    Ok(Arc::new(oracle))
}

fn create_noop(_config: &Config) -> Result<Arc<dyn DecisionOracle>> {
    Ok(Arc::new(NoopOracle))
}

/// Resolve the backend to use.
///
/// Priority order:
/// 1. CLI flag (`--backend`)
/// 2. `FIXLOOP_BACKEND` environment variable
/// 3. Config file (`[agent].backend`)
pub(crate) fn resolve_backend(config: &Config, backend_override: Option<&str>) -> Result<Backend> {
    let env_backend = std::env::var("FIXLOOP_BACKEND").ok();
    resolve_backend_with_env(config, backend_override, env_backend.as_deref())
}

fn resolve_backend_with_env(
    config: &Config,
    backend_override: Option<&str>,
    env_backend: Option<&str>,
) -> Result<Backend> {
    if let Some(b) = backend_override {
        debug!("Using CLI backend override: {}", b);
        return b.parse();
    }

    if let Some(env_val) = env_backend {
        if !env_val.is_empty() {
            debug!("Using FIXLOOP_BACKEND env var: {}", env_val);
            return env_val.parse();
        }
    }

    config.agent.get_backend()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_display_round_trips() {
        for backend in Backend::ALL {
            assert_eq!(backend.to_string().parse::<Backend>().unwrap(), backend);
        }
    }

    #[test]
    fn test_backend_aliases() {
        assert_eq!("dummy".parse::<Backend>().unwrap(), Backend::Noop);
        assert_eq!("Claude".parse::<Backend>().unwrap(), Backend::ClaudeCli);
        assert_eq!("claude-code".parse::<Backend>().unwrap(), Backend::ClaudeCli);
        assert_eq!("codex".parse::<Backend>().unwrap(), Backend::CodexCli);
        assert!("gemini".parse::<Backend>().is_err());
    }

    #[test]
    fn test_resolve_backend_config_default() {
        let config = Config::default();
        let backend = resolve_backend_with_env(&config, None, None).unwrap();
        assert_eq!(backend, Backend::Hosted);
    }

    #[test]
    fn test_resolve_backend_cli_override_wins() {
        let config = Config::default();
        let backend = resolve_backend_with_env(&config, Some("noop"), Some("codex")).unwrap();
        assert_eq!(backend, Backend::Noop);
    }

    #[test]
    fn test_resolve_backend_env_over_config() {
        let config = Config::default();
        let backend = resolve_backend_with_env(&config, None, Some("codex-cli")).unwrap();
        assert_eq!(backend, Backend::CodexCli);
    }

    #[test]
    fn test_resolve_backend_empty_env_falls_back() {
        let mut config = Config::default();
        config.agent.backend = "claude-cli".to_string();
        let backend = resolve_backend_with_env(&config, None, Some("")).unwrap();
        assert_eq!(backend, Backend::ClaudeCli);
    }

    #[test]
    fn test_registry_creates_noop() {
        let oracle = Registry::new()
            .create(Backend::Noop, &Config::default())
            .unwrap();
        assert_eq!(oracle.name(), "noop");
    }

    #[test]
    fn test_registry_reports_missing_cli() {
        let mut config = Config::default();
        config.oracle.codex.path = "/nonexistent/codex".to_string();
        let err = Registry::new()
            .create(Backend::CodexCli, &config)
            .err()
            .unwrap();
        assert!(err.to_string().contains("Missing dependency"));
    }
}
