use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::plan_validator::ValidationOptions;

/// Top-level configuration loaded from `~/.conductor/config.toml`.
///
/// API keys are never stored here. Provider sections name the environment
/// variable that holds the key and it is read at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub planner: PlannerConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
}

impl Config {
    /// Load config from `~/.conductor/config.toml`, falling back to defaults
    /// when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let cfg: Config = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.general.validate()?;
        self.planner.validate()?;
        self.dispatch.validate()?;
        self.scheduler.validate()?;
        self.validation.validate()?;
        self.agents.validate()?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".conductor")
            .join("config.toml")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_project_name")]
    pub project_name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// `human` or `json`.
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            project_name: default_project_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl GeneralConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.log_format.as_str(), "human" | "json") {
            return Err(ConfigError::Validation(format!(
                "general.log_format must be `human` or `json`, got `{}`",
                self.log_format
            )));
        }
        Ok(())
    }
}

fn default_project_name() -> String {
    "conductor".into()
}
fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "human".into()
}

/// One LLM endpoint the planner may call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSlotConfig {
    /// `openai`, `anthropic` or `mock`.
    pub provider: String,
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Name of the env var holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
}

impl ModelSlotConfig {
    fn validate(&self, section: &str) -> Result<(), ConfigError> {
        if !matches!(self.provider.as_str(), "openai" | "anthropic" | "mock") {
            return Err(ConfigError::Validation(format!(
                "{section}.provider `{}` is not one of openai, anthropic, mock",
                self.provider
            )));
        }
        if self.model.trim().is_empty() {
            return Err(ConfigError::Validation(format!("{section}.model must not be empty")));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::Validation(format!(
                "{section}.temperature must be within 0.0..=2.0"
            )));
        }
        if self.max_tokens == 0 {
            return Err(ConfigError::Validation(format!("{section}.max_tokens must be > 0")));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerConfig {
    #[serde(default = "default_primary_slot")]
    pub primary: ModelSlotConfig,
    #[serde(default = "default_fallback_slot")]
    pub fallback: Option<ModelSlotConfig>,
    #[serde(default = "default_planner_timeout")]
    pub timeout_secs: u64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            primary: default_primary_slot(),
            fallback: default_fallback_slot(),
            timeout_secs: default_planner_timeout(),
        }
    }
}

impl PlannerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.primary.validate("planner.primary")?;
        if let Some(fallback) = &self.fallback {
            fallback.validate("planner.fallback")?;
        }
        if self.timeout_secs == 0 {
            return Err(ConfigError::Validation("planner.timeout_secs must be > 0".into()));
        }
        Ok(())
    }
}

fn default_primary_slot() -> ModelSlotConfig {
    ModelSlotConfig {
        provider: "openai".into(),
        model: "gpt-4o".into(),
        temperature: default_temperature(),
        max_tokens: default_max_tokens(),
        api_key_env: Some("OPENAI_API_KEY".into()),
        base_url: None,
    }
}

fn default_fallback_slot() -> Option<ModelSlotConfig> {
    Some(ModelSlotConfig {
        provider: "openai".into(),
        model: "gpt-4o-mini".into(),
        temperature: 0.5,
        max_tokens: default_max_tokens(),
        api_key_env: Some("OPENAI_API_KEY".into()),
        base_url: None,
    })
}

fn default_temperature() -> f32 {
    0.2
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_planner_timeout() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Per-attempt timeout for `dispatch_task`. Kept shorter than the planner timeout.
    #[serde(default = "default_dispatch_timeout")]
    pub timeout_ms: u64,
    #[serde(default = "default_dispatch_retries")]
    pub max_retries: u32,
    /// Initial backoff; doubles per attempt.
    #[serde(default = "default_dispatch_backoff")]
    pub backoff_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_dispatch_timeout(),
            max_retries: default_dispatch_retries(),
            backoff_ms: default_dispatch_backoff(),
        }
    }
}

impl DispatchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_ms == 0 {
            return Err(ConfigError::Validation("dispatch.timeout_ms must be > 0".into()));
        }
        if self.max_retries > 10 {
            return Err(ConfigError::Validation(
                "dispatch.max_retries must be at most 10".into(),
            ));
        }
        Ok(())
    }
}

fn default_dispatch_timeout() -> u64 {
    10_000
}
fn default_dispatch_retries() -> u32 {
    1
}
fn default_dispatch_backoff() -> u64 {
    200
}

/// What the scheduler waits for before moving to the next stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BarrierMode {
    /// Every dispatch call of the stage has settled.
    #[default]
    Dispatch,
    /// Every task of the stage has reached a terminal status.
    Completion,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub barrier: BarrierMode,
    /// Cap simultaneously outstanding dispatches at each stage's `maxConcurrency`.
    #[serde(default = "default_true")]
    pub enforce_concurrency: bool,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_completion_timeout")]
    pub completion_timeout_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            barrier: BarrierMode::default(),
            enforce_concurrency: true,
            poll_interval_ms: default_poll_interval(),
            completion_timeout_secs: default_completion_timeout(),
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_secs(self.completion_timeout_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "scheduler.poll_interval_ms must be > 0".into(),
            ));
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}
fn default_poll_interval() -> u64 {
    500
}
fn default_completion_timeout() -> u64 {
    1800
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    #[serde(default)]
    pub resource_tolerance: f64,
    #[serde(default = "default_true")]
    pub enforce_stage_budgets: bool,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            resource_tolerance: 0.0,
            enforce_stage_budgets: true,
        }
    }
}

impl ValidationConfig {
    pub fn options(&self) -> ValidationOptions {
        ValidationOptions {
            resource_tolerance: self.resource_tolerance,
            enforce_stage_budgets: self.enforce_stage_budgets,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.resource_tolerance.is_finite() || self.resource_tolerance < 0.0 {
            return Err(ConfigError::Validation(
                "validation.resource_tolerance must be a non-negative number".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentsConfig {
    /// Agent domain -> base URL of its HTTP agent service.
    #[serde(default)]
    pub endpoints: BTreeMap<String, String>,
    /// Env var holding a bearer token sent to every agent service.
    #[serde(default)]
    pub api_key_env: Option<String>,
}

impl AgentsConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        for (domain, url) in &self.endpoints {
            if domain.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "agents.endpoints contains an empty domain name".into(),
                ));
            }
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigError::Validation(format!(
                    "agents.endpoints.{domain} must be an http(s) URL, got `{url}`"
                )));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
