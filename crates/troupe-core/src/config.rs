//! Configuration management for Troupe
//!
//! Configuration is loaded once at startup from `.troupe/config.toml` and
//! passed explicitly to every component that needs it. Nothing in the
//! runtime reads ambient global settings.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Result, TroupeError};

/// Repository-level Troupe configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TroupeConfig {
    /// Directory for persisted agent snapshots
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Agent loop budgets and timeouts
    #[serde(default)]
    pub agents: AgentsConfig,

    /// Dispatcher queue sizing
    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    /// Per-model rate limits
    #[serde(default = "default_models")]
    pub models: Vec<ModelLimits>,

    /// Logging setup consumed by the binary
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Budget and timeout settings for agent loops
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsConfig {
    /// Iterations allowed in PLANNING before a budget review
    #[serde(default = "default_max_planning_loops")]
    pub max_planning_loops: u32,

    /// Iterations allowed in CODING before a budget review
    #[serde(default = "default_max_coding_loops")]
    pub max_coding_loops: u32,

    /// Context messages included in a budget review snapshot
    #[serde(default = "default_recent_activity_window")]
    pub recent_activity_window: usize,

    /// Upper bound on waiting for a RESULT, in seconds (0 disables)
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Model used by coders
    #[serde(default = "default_coder_model")]
    pub coder_model: String,

    /// Model used by the architect
    #[serde(default = "default_architect_model")]
    pub architect_model: String,
}

impl AgentsConfig {
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_secs > 0).then(|| Duration::from_secs(self.request_timeout_secs))
    }
}

/// Dispatcher queue sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Ring-buffer capacity of the state-change notification queue
    #[serde(default = "default_notification_capacity")]
    pub notification_capacity: usize,

    /// Per-agent inbox capacity
    #[serde(default = "default_inbox_capacity")]
    pub inbox_capacity: usize,
}

/// Rate limits for one model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelLimits {
    pub name: String,
    /// Tokens allowed in any 60-second window
    pub max_tpm: u64,
    /// Spend allowed per UTC day, in USD
    pub daily_budget_usd: f64,
    /// Concurrent in-flight calls
    pub max_connections: usize,
    /// Price used to turn tokens into spend
    #[serde(default = "default_usd_per_1k_tokens")]
    pub usd_per_1k_tokens: f64,
}

impl ModelLimits {
    pub fn new(name: impl Into<String>, max_tpm: u64, daily_budget_usd: f64, max_connections: usize) -> Self {
        Self {
            name: name.into(),
            max_tpm,
            daily_budget_usd,
            max_connections,
            usd_per_1k_tokens: default_usd_per_1k_tokens(),
        }
    }

    pub fn with_price(mut self, usd_per_1k_tokens: f64) -> Self {
        self.usd_per_1k_tokens = usd_per_1k_tokens;
        self
    }

    /// Spend for a given token count
    pub fn cost_of(&self, tokens: u64) -> f64 {
        tokens as f64 / 1000.0 * self.usd_per_1k_tokens
    }
}

/// Logging configuration, built once and handed to the subscriber setup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `info` or `troupe_orchestrator=debug`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Include the event target in log lines
    #[serde(default)]
    pub with_target: bool,
}

fn default_max_planning_loops() -> u32 {
    8
}

fn default_max_coding_loops() -> u32 {
    12
}

fn default_recent_activity_window() -> usize {
    5
}

fn default_request_timeout_secs() -> u64 {
    600
}

fn default_coder_model() -> String {
    "claude-sonnet-4".to_string()
}

fn default_architect_model() -> String {
    "claude-opus-4".to_string()
}

fn default_notification_capacity() -> usize {
    256
}

fn default_inbox_capacity() -> usize {
    64
}

fn default_usd_per_1k_tokens() -> f64 {
    0.003
}

fn default_models() -> Vec<ModelLimits> {
    vec![
        ModelLimits::new("claude-sonnet-4", 400_000, 50.0, 4).with_price(0.003),
        ModelLimits::new("claude-opus-4", 200_000, 50.0, 2).with_price(0.015),
    ]
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".troupe/state")
}

impl TroupeConfig {
    /// Load configuration from `.troupe/config.toml` or use defaults
    pub fn load_or_default(repo_root: &Path) -> Result<Self> {
        let config_path = repo_root.join(".troupe/config.toml");

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: Self = toml::from_str(&content)
                .map_err(|e| TroupeError::Config(format!("Failed to parse config file: {}", e)))?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Write default configuration to `.troupe/config.toml`
    pub fn write_default(repo_root: &Path) -> Result<PathBuf> {
        let config_dir = repo_root.join(".troupe");
        std::fs::create_dir_all(&config_dir)?;

        let config_path = config_dir.join("config.toml");
        let content = toml::to_string_pretty(&Self::default())
            .map_err(|e| TroupeError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(&config_path, content)?;
        Ok(config_path)
    }

    /// Reject settings the runtime cannot honor
    pub fn validate(&self) -> Result<()> {
        if self.agents.max_planning_loops == 0 || self.agents.max_coding_loops == 0 {
            return Err(TroupeError::Config("loop budgets must be at least 1".to_string()));
        }
        if self.dispatcher.notification_capacity == 0 || self.dispatcher.inbox_capacity == 0 {
            return Err(TroupeError::Config("dispatcher capacities must be at least 1".to_string()));
        }
        for model in &self.models {
            if model.max_connections == 0 {
                return Err(TroupeError::Config(format!(
                    "model {} needs at least one connection",
                    model.name
                )));
            }
        }
        Ok(())
    }

    /// Limits configured for `name`
    pub fn model(&self, name: &str) -> Option<&ModelLimits> {
        self.models.iter().find(|m| m.name == name)
    }
}

impl Default for TroupeConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            agents: AgentsConfig::default(),
            dispatcher: DispatcherConfig::default(),
            models: default_models(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            max_planning_loops: default_max_planning_loops(),
            max_coding_loops: default_max_coding_loops(),
            recent_activity_window: default_recent_activity_window(),
            request_timeout_secs: default_request_timeout_secs(),
            coder_model: default_coder_model(),
            architect_model: default_architect_model(),
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            notification_capacity: default_notification_capacity(),
            inbox_capacity: default_inbox_capacity(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            with_target: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = TroupeConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config.agents.max_planning_loops, 8);
        assert_eq!(config.dispatcher.notification_capacity, 256);
        assert!(config.model("claude-sonnet-4").is_some());
    }

    #[test]
    fn test_write_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = TroupeConfig::write_default(dir.path()).unwrap();
        assert!(path.ends_with(".troupe/config.toml"));

        let config = TroupeConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config.models.len(), 2);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".troupe")).unwrap();
        std::fs::write(
            dir.path().join(".troupe/config.toml"),
            "[agents]\nmax_coding_loops = 3\n\n[[models]]\nname = \"local\"\nmax_tpm = 1000\ndaily_budget_usd = 1.0\nmax_connections = 1\n",
        )
        .unwrap();

        let config = TroupeConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config.agents.max_coding_loops, 3);
        assert_eq!(config.agents.max_planning_loops, 8);
        assert_eq!(config.models.len(), 1);
        assert_eq!(config.models[0].usd_per_1k_tokens, 0.003);
    }

    #[test]
    fn test_zero_budget_rejected() {
        let mut config = TroupeConfig::default();
        config.agents.max_planning_loops = 0;
        assert!(matches!(config.validate(), Err(TroupeError::Config(_))));
    }

    #[test]
    fn test_cost_of() {
        let limits = ModelLimits::new("m", 1000, 1.0, 1).with_price(0.25);
        assert_eq!(limits.cost_of(1000), 0.25);
        assert_eq!(limits.cost_of(4000), 1.0);
    }

    #[test]
    fn test_request_timeout_zero_disables() {
        let mut agents = AgentsConfig::default();
        assert_eq!(agents.request_timeout(), Some(Duration::from_secs(600)));
        agents.request_timeout_secs = 0;
        assert_eq!(agents.request_timeout(), None);
    }
}
