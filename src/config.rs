//! Orchestrator configuration: TOML-loaded per-agent table plus global
//! timeout overrides (§5 defaults), grounded in the teacher's
//! `GlobalConfig` validate-on-load pattern.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::lifecycle::spawner::SpawnConfig;
use crate::lifecycle::AgentLifecycleConfig;
use crate::session::SessionManagerConfig;
use crate::{AppError, Result};

/// One configured agent: which host CLI to spawn and where.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AgentConfig {
    /// Logical agent name, used in session keys and routing.
    pub name: String,
    /// Host CLI binary to spawn (e.g. `claude`, `gh`, `true` in tests).
    pub host_cli: String,
    /// Default arguments passed to the host CLI on every spawn.
    #[serde(default)]
    pub host_cli_args: Vec<String>,
    /// Workspace root the agent's file/terminal handlers are sandboxed to.
    pub workspace_root: PathBuf,
    /// Extra environment variables merged in ahead of call-site overrides.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Timeout overrides layered on top of the §5 defaults. Any field left out
/// of the TOML file falls back to its documented default.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", default)]
pub struct TimeoutOverrides {
    /// Health-check loop interval, in seconds.
    pub health_check_seconds: u64,
    /// Graceful-shutdown drain budget, in seconds.
    pub shutdown_seconds: u64,
    /// Initial respawn backoff, in seconds.
    pub backoff_initial_seconds: u64,
    /// Maximum respawn backoff, in seconds.
    pub backoff_max_seconds: u64,
    /// Multiplier applied to backoff after each failed spawn.
    pub backoff_multiplier: u32,
    /// Budget for `initialize()` to complete after spawn, in seconds.
    pub agent_ready_seconds: u64,
    /// Context-usage sample timeout, in seconds.
    pub context_usage_timeout_seconds: u64,
    /// Context-usage sample debounce window, in seconds.
    pub context_usage_debounce_seconds: u64,
    /// Session-recency window used by the rotate/recover decision, in minutes.
    pub session_recency_minutes: u64,
    /// Context-usage fraction (0.0-1.0) at or above which a session rotates.
    pub rotation_threshold: f64,
}

impl Default for TimeoutOverrides {
    fn default() -> Self {
        Self {
            health_check_seconds: 30,
            shutdown_seconds: 10,
            backoff_initial_seconds: 1,
            backoff_max_seconds: 60,
            backoff_multiplier: 2,
            agent_ready_seconds: 30,
            context_usage_timeout_seconds: 10,
            context_usage_debounce_seconds: 30,
            session_recency_minutes: 30,
            rotation_threshold: 0.70,
        }
    }
}

/// Discord-flavored streaming split caps, overridable per deployment.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct StreamingCaps {
    /// Soft cap: the splitter prefers to break at or below this length.
    pub soft_cap: usize,
    /// Hard cap: a chunk must never exceed this length.
    pub hard_cap: usize,
}

impl Default for StreamingCaps {
    fn default() -> Self {
        Self { soft_cap: crate::streaming::DEFAULT_SOFT_CAP, hard_cap: crate::streaming::DEFAULT_HARD_CAP }
    }
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct OrchestratorConfig {
    /// Every agent this orchestrator manages a lifecycle for.
    pub agents: Vec<AgentConfig>,
    /// Path to the optional identity YAML file.
    pub identity_path: PathBuf,
    /// Path to the supervisor-provided checkpoint file.
    pub checkpoint_path: PathBuf,
    /// Named local socket the supervisor listens on, if any.
    #[serde(default)]
    pub ipc_socket_name: Option<String>,
    /// Path to the `SQLite` database file backing event/conversation storage.
    pub db_path: PathBuf,
    /// Whether to emit JSON-formatted logs instead of plain text.
    #[serde(default)]
    pub log_json: bool,
    /// Timeout and threshold overrides.
    #[serde(default)]
    pub timeouts: TimeoutOverrides,
    /// Streaming split caps.
    #[serde(default)]
    pub streaming: StreamingCaps,
}

impl OrchestratorConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and validate it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// The configured agent names, in declaration order.
    #[must_use]
    pub fn agent_names(&self) -> Vec<String> {
        self.agents.iter().map(|agent| agent.name.clone()).collect()
    }

    /// Build the per-agent lifecycle config for `agent`, applying the
    /// shared timeout overrides.
    #[must_use]
    pub fn lifecycle_config(&self, agent: &AgentConfig) -> AgentLifecycleConfig {
        let spawn = SpawnConfig {
            host_cli: agent.host_cli.clone(),
            host_cli_args: agent.host_cli_args.clone(),
            workspace_root: agent.workspace_root.clone(),
            user_env: agent.env.clone(),
        };
        let mut config = AgentLifecycleConfig::new(agent.name.clone(), spawn);
        config.health_check_interval = Duration::from_secs(self.timeouts.health_check_seconds);
        config.shutdown_timeout = Duration::from_secs(self.timeouts.shutdown_seconds);
        config.backoff_initial = Duration::from_secs(self.timeouts.backoff_initial_seconds);
        config.backoff_max = Duration::from_secs(self.timeouts.backoff_max_seconds);
        config.backoff_multiplier = self.timeouts.backoff_multiplier;
        config.agent_ready_timeout = Duration::from_secs(self.timeouts.agent_ready_seconds);
        config
    }

    /// Build the session lifecycle manager config from the timeout overrides.
    #[must_use]
    pub fn session_manager_config(&self) -> SessionManagerConfig {
        SessionManagerConfig {
            rotation_threshold: self.timeouts.rotation_threshold,
            recent_conversation_max_age: Duration::from_secs(self.timeouts.session_recency_minutes * 60),
        }
    }

    /// Graceful-shutdown drain budget for the orchestrator itself.
    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.shutdown_seconds)
    }

    fn validate(&self) -> Result<()> {
        if self.agents.is_empty() {
            return Err(AppError::Config("at least one agent must be configured".into()));
        }

        let mut seen = std::collections::HashSet::new();
        for agent in &self.agents {
            if agent.name.is_empty() {
                return Err(AppError::Config("agent name must not be empty".into()));
            }
            if agent.host_cli.is_empty() {
                return Err(AppError::Config(format!("agent '{}' has an empty host_cli", agent.name)));
            }
            if !seen.insert(agent.name.clone()) {
                return Err(AppError::Config(format!("duplicate agent name '{}'", agent.name)));
            }
        }

        if !(0.0..=1.0).contains(&self.timeouts.rotation_threshold) {
            return Err(AppError::Config("rotation_threshold must be between 0.0 and 1.0".into()));
        }

        if self.streaming.soft_cap > self.streaming.hard_cap {
            return Err(AppError::Config("streaming.soft_cap must not exceed streaming.hard_cap".into()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_toml() -> &'static str {
        r#"
            identity_path = "identity.yaml"
            checkpoint_path = "checkpoint.yaml"
            db_path = "kynetic.db"

            [[agents]]
            name = "agentA"
            host_cli = "claude"
            workspace_root = "/tmp"
        "#
    }

    #[test]
    fn parses_minimal_config_with_defaults() {
        let config = OrchestratorConfig::from_toml_str(sample_toml()).expect("should parse");
        assert_eq!(config.agents.len(), 1);
        assert_eq!(config.timeouts.rotation_threshold, 0.70);
        assert_eq!(config.streaming.hard_cap, crate::streaming::DEFAULT_HARD_CAP);
    }

    #[test]
    fn rejects_empty_agent_list() {
        let raw = r#"
            identity_path = "identity.yaml"
            checkpoint_path = "checkpoint.yaml"
            db_path = "kynetic.db"
            agents = []
        "#;
        let err = OrchestratorConfig::from_toml_str(raw).unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[test]
    fn rejects_duplicate_agent_names() {
        let raw = format!(
            "{}\n[[agents]]\nname = \"agentA\"\nhost_cli = \"gh\"\nworkspace_root = \"/tmp\"\n",
            sample_toml()
        );
        let err = OrchestratorConfig::from_toml_str(&raw).unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[test]
    fn rejects_inverted_streaming_caps() {
        let raw = format!("{}\n[streaming]\nsoft_cap = 2000\nhard_cap = 1000\n", sample_toml());
        let err = OrchestratorConfig::from_toml_str(&raw).unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }
}
