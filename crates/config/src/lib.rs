//! Configuration loading, validation, and management for toolweave.
//!
//! Loads configuration from `~/.toolweave/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.toolweave/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// API key (can be overridden per-provider)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Default model provider
    #[serde(default = "default_provider")]
    pub default_provider: String,

    /// Default model
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Default temperature
    #[serde(default = "default_temperature")]
    pub default_temperature: f32,

    /// Default max tokens per model response
    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: u32,

    /// Agent loop and context budget
    #[serde(default)]
    pub agent: AgentConfig,

    /// Tool dispatch
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Provider-call retries
    #[serde(default)]
    pub provider_retry: ProviderRetryConfig,

    /// Long-term memory
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Reward weights and importance update
    #[serde(default)]
    pub reward: RewardConfig,

    /// Reflection thresholds
    #[serde(default)]
    pub reflection: ReflectionConfig,

    /// Provider-specific configurations
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,

    /// Cost accounting
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

fn default_provider() -> String {
    "openrouter".into()
}
fn default_model() -> String {
    "anthropic/claude-sonnet-4".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    4096
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_key", &redact(&self.api_key))
            .field("default_provider", &self.default_provider)
            .field("default_model", &self.default_model)
            .field("default_temperature", &self.default_temperature)
            .field("default_max_tokens", &self.default_max_tokens)
            .field("agent", &self.agent)
            .field("dispatch", &self.dispatch)
            .field("provider_retry", &self.provider_retry)
            .field("memory", &self.memory)
            .field("reward", &self.reward)
            .field("reflection", &self.reflection)
            .field("providers", &self.providers)
            .field("telemetry", &self.telemetry)
            .finish()
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("api_key", &redact(&self.api_key))
            .field("api_url", &self.api_url)
            .field("default_model", &self.default_model)
            .finish()
    }
}

/// Agent loop limits and context budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Provider calls allowed per run before giving up
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    /// Estimated-token ceiling for each provider request
    #[serde(default = "default_context_limit")]
    pub context_limit_tokens: usize,

    /// Most recent rounds never collapsed or dropped
    #[serde(default = "default_protected_rounds")]
    pub protected_rounds: usize,

    /// Token charge per image attachment
    #[serde(default = "default_image_token_cost")]
    pub image_token_cost: usize,

    /// Upper bound on a collapsed tool summary
    #[serde(default = "default_summary_max_chars")]
    pub summary_max_chars: usize,

    /// Memories recalled per layer at the start of a run
    #[serde(default = "default_recall_k")]
    pub recall_k: usize,

    /// Forced-compaction retries after the provider rejects the context
    #[serde(default = "default_max_context_retries")]
    pub max_context_retries: usize,

    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

fn default_max_iterations() -> usize {
    25
}
fn default_context_limit() -> usize {
    64_000
}
fn default_protected_rounds() -> usize {
    2
}
fn default_image_token_cost() -> usize {
    1000
}
fn default_summary_max_chars() -> usize {
    200
}
fn default_recall_k() -> usize {
    3
}
fn default_max_context_retries() -> usize {
    3
}
fn default_system_prompt() -> String {
    "You are an autonomous assistant that completes tasks by calling tools. \
     Plan briefly, call tools to act and observe, and reply without tool calls \
     once the task is complete."
        .into()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            context_limit_tokens: default_context_limit(),
            protected_rounds: default_protected_rounds(),
            image_token_cost: default_image_token_cost(),
            summary_max_chars: default_summary_max_chars(),
            recall_k: default_recall_k(),
            max_context_retries: default_max_context_retries(),
            system_prompt: default_system_prompt(),
        }
    }
}

/// Tool dispatch pool, timeout and retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Concurrent-affinity worker pool size
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Hard wall-clock timeout per attempt
    #[serde(default = "default_tool_timeout")]
    pub timeout_secs: u64,

    /// Retries after the first attempt for transient failures
    #[serde(default = "default_tool_retries")]
    pub max_retries: u32,

    #[serde(default = "default_tool_base_delay")]
    pub base_delay_ms: u64,

    #[serde(default = "default_tool_max_delay")]
    pub max_delay_ms: u64,

    /// Tool output is truncated past this many lines
    #[serde(default = "default_max_output_lines")]
    pub max_output_lines: usize,

    /// Commands the `shell` tool may run (first word)
    #[serde(default = "default_allowed_commands")]
    pub allowed_commands: Vec<String>,
}

fn default_pool_size() -> usize {
    4
}
fn default_tool_timeout() -> u64 {
    60
}
fn default_tool_retries() -> u32 {
    3
}
fn default_tool_base_delay() -> u64 {
    1000
}
fn default_tool_max_delay() -> u64 {
    8000
}
fn default_max_output_lines() -> usize {
    200
}
fn default_allowed_commands() -> Vec<String> {
    ["ls", "cat", "echo", "pwd", "grep", "find", "wc", "head", "tail", "date"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            timeout_secs: default_tool_timeout(),
            max_retries: default_tool_retries(),
            base_delay_ms: default_tool_base_delay(),
            max_delay_ms: default_tool_max_delay(),
            max_output_lines: default_max_output_lines(),
            allowed_commands: default_allowed_commands(),
        }
    }
}

/// Retry policy for transient provider failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRetryConfig {
    #[serde(default = "default_provider_retries")]
    pub max_retries: u32,

    #[serde(default = "default_provider_base_delay")]
    pub base_delay_ms: u64,

    #[serde(default = "default_provider_max_delay")]
    pub max_delay_ms: u64,
}

fn default_provider_retries() -> u32 {
    3
}
fn default_provider_base_delay() -> u64 {
    5000
}
fn default_provider_max_delay() -> u64 {
    30_000
}

impl Default for ProviderRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_provider_retries(),
            base_delay_ms: default_provider_base_delay(),
            max_delay_ms: default_provider_max_delay(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// "sqlite" or "memory"
    #[serde(default = "default_memory_backend")]
    pub backend: String,

    /// SQLite file; defaults to `~/.toolweave/memory.db`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    /// "hash" or the name of a configured provider
    #[serde(default = "default_embedding")]
    pub embedding: String,

    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    #[serde(default = "default_dimension")]
    pub dimension: usize,

    /// Maximum number of procedural strategies kept
    #[serde(default = "default_procedural_capacity")]
    pub procedural_capacity: usize,

    /// Episodes needed (including the new one) before a rule is derived
    #[serde(default = "default_cluster_min_episodes")]
    pub cluster_min_episodes: usize,

    #[serde(default = "default_cluster_threshold")]
    pub cluster_threshold: f32,

    /// Similarity at which a new rule strengthens an existing one instead
    #[serde(default = "default_rule_dedup_threshold")]
    pub rule_dedup_threshold: f32,

    /// Episodes kept after pruning; 0 disables pruning
    #[serde(default = "default_max_episodes")]
    pub max_episodes: usize,
}

fn default_memory_backend() -> String {
    "sqlite".into()
}
fn default_embedding() -> String {
    "hash".into()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".into()
}
fn default_dimension() -> usize {
    384
}
fn default_procedural_capacity() -> usize {
    50
}
fn default_cluster_min_episodes() -> usize {
    3
}
fn default_cluster_threshold() -> f32 {
    0.85
}
fn default_rule_dedup_threshold() -> f32 {
    0.80
}
fn default_max_episodes() -> usize {
    5000
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            backend: default_memory_backend(),
            path: None,
            embedding: default_embedding(),
            embedding_model: default_embedding_model(),
            dimension: default_dimension(),
            procedural_capacity: default_procedural_capacity(),
            cluster_min_episodes: default_cluster_min_episodes(),
            cluster_threshold: default_cluster_threshold(),
            rule_dedup_threshold: default_rule_dedup_threshold(),
            max_episodes: default_max_episodes(),
        }
    }
}

impl MemoryConfig {
    /// Resolved SQLite path.
    pub fn db_path(&self) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| AppConfig::config_dir().join("memory.db"))
    }
}

/// `reward = w_success·s + w_efficiency·e − w_error·p + w_novelty·n`,
/// then `importance' = importance·decay + reward·alpha`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardConfig {
    #[serde(default = "default_w_success")]
    pub w_success: f32,
    #[serde(default = "default_w_efficiency")]
    pub w_efficiency: f32,
    #[serde(default = "default_w_error")]
    pub w_error: f32,
    #[serde(default = "default_w_novelty")]
    pub w_novelty: f32,
    #[serde(default = "default_decay")]
    pub decay: f32,
    #[serde(default = "default_alpha")]
    pub alpha: f32,
    /// Per-day exponential decay applied to episode importance
    #[serde(default = "default_time_decay_lambda")]
    pub time_decay_lambda: f32,
    /// Run time decay every N recorded episodes
    #[serde(default = "default_time_decay_every")]
    pub time_decay_every: usize,
}

fn default_w_success() -> f32 {
    0.40
}
fn default_w_efficiency() -> f32 {
    0.25
}
fn default_w_error() -> f32 {
    0.20
}
fn default_w_novelty() -> f32 {
    0.15
}
fn default_decay() -> f32 {
    0.9
}
fn default_alpha() -> f32 {
    0.5
}
fn default_time_decay_lambda() -> f32 {
    0.01
}
fn default_time_decay_every() -> usize {
    10
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            w_success: default_w_success(),
            w_efficiency: default_w_efficiency(),
            w_error: default_w_error(),
            w_novelty: default_w_novelty(),
            decay: default_decay(),
            alpha: default_alpha(),
            time_decay_lambda: default_time_decay_lambda(),
            time_decay_every: default_time_decay_every(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflectionConfig {
    /// Tasks between deep passes
    #[serde(default = "default_deep_interval")]
    pub deep_interval: usize,

    /// Error rate over the last 3 tasks that forces an early deep pass
    #[serde(default = "default_error_spike")]
    pub error_spike_threshold: f32,

    /// Successful repetitions of a tool sequence before it becomes a strategy
    #[serde(default = "default_strategy_min_repeats")]
    pub strategy_min_repeats: usize,

    #[serde(default = "default_true")]
    pub deep_pass_enabled: bool,
}

fn default_deep_interval() -> usize {
    5
}
fn default_error_spike() -> f32 {
    0.5
}
fn default_strategy_min_repeats() -> usize {
    3
}
fn default_true() -> bool {
    true
}

impl Default for ReflectionConfig {
    fn default() -> Self {
        Self {
            deep_interval: default_deep_interval(),
            error_spike_threshold: default_error_spike(),
            strategy_min_repeats: default_strategy_min_repeats(),
            deep_pass_enabled: true,
        }
    }
}

/// Cost accounting configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Custom model pricing overrides (model name → pricing)
    #[serde(default)]
    pub custom_pricing: HashMap<String, PricingOverrideConfig>,
}

/// Custom per-million-token pricing for a model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingOverrideConfig {
    /// Price per 1M input tokens in USD
    pub input_per_m: f64,
    /// Price per 1M cache-hit input tokens; defaults to the input price
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_input_per_m: Option<f64>,
    /// Price per 1M output tokens in USD
    pub output_per_m: f64,
    /// Price per 1M reasoning tokens; defaults to the output price
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_per_m: Option<f64>,
}

impl AppConfig {
    /// Load configuration from the default path (~/.toolweave/config.toml).
    ///
    /// Environment variables override file values.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        Self::load_with_env(&config_path)
    }

    /// Load from `path`, then apply environment overrides and validate.
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load_from(path)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if self.api_key.is_none() {
            self.api_key = std::env::var("TOOLWEAVE_API_KEY")
                .ok()
                .or_else(|| std::env::var("OPENROUTER_API_KEY").ok())
                .or_else(|| std::env::var("OPENAI_API_KEY").ok())
                .or_else(|| std::env::var("ANTHROPIC_API_KEY").ok());
        }

        if let Ok(provider) = std::env::var("TOOLWEAVE_PROVIDER") {
            self.default_provider = provider;
        }

        if let Ok(model) = std::env::var("TOOLWEAVE_MODEL") {
            self.default_model = model;
        }

        if let Some(limit) = std::env::var("TOOLWEAVE_CONTEXT_LIMIT")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.agent.context_limit_tokens = limit;
        }

        if let Ok(path) = std::env::var("TOOLWEAVE_MEMORY_PATH") {
            self.memory.path = Some(PathBuf::from(path));
        }
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".toolweave")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: &str| Err(ConfigError::ValidationError(msg.into()));

        if self.default_temperature < 0.0 || self.default_temperature > 2.0 {
            return fail("default_temperature must be between 0.0 and 2.0");
        }
        if self.agent.max_iterations == 0 {
            return fail("agent.max_iterations must be > 0");
        }
        if self.agent.protected_rounds < 2 {
            return fail("agent.protected_rounds must be at least 2");
        }
        if self.dispatch.pool_size == 0 {
            return fail("dispatch.pool_size must be > 0");
        }
        if self.memory.dimension == 0 {
            return fail("memory.dimension must be > 0");
        }
        if self.memory.procedural_capacity == 0 {
            return fail("memory.procedural_capacity must be > 0");
        }
        for (name, value) in [
            ("memory.cluster_threshold", self.memory.cluster_threshold),
            ("memory.rule_dedup_threshold", self.memory.rule_dedup_threshold),
        ] {
            if value <= 0.0 || value > 1.0 {
                return Err(ConfigError::ValidationError(format!(
                    "{name} must be in (0, 1]"
                )));
            }
        }
        let r = &self.reward;
        if [r.w_success, r.w_efficiency, r.w_error, r.w_novelty, r.alpha]
            .iter()
            .any(|w| *w < 0.0)
        {
            return fail("reward weights and alpha must be non-negative");
        }
        if !(0.0..=1.0).contains(&r.decay) {
            return fail("reward.decay must be between 0.0 and 1.0");
        }

        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
            || self.providers.values().any(|p| p.api_key.is_some())
    }

    /// Generate a default config TOML string (for `config init`).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            default_provider: default_provider(),
            default_model: default_model(),
            default_temperature: default_temperature(),
            default_max_tokens: default_max_tokens(),
            agent: AgentConfig::default(),
            dispatch: DispatchConfig::default(),
            provider_retry: ProviderRetryConfig::default(),
            memory: MemoryConfig::default(),
            reward: RewardConfig::default(),
            reflection: ReflectionConfig::default(),
            providers: HashMap::new(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert_eq!(config.default_provider, "openrouter");
        assert_eq!(config.agent.max_iterations, 25);
        assert_eq!(config.dispatch.pool_size, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.default_provider, config.default_provider);
        assert_eq!(parsed.memory.dimension, config.memory.dimension);
    }

    #[test]
    fn invalid_temperature_rejected() {
        let config = AppConfig {
            default_temperature: 5.0,
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn protected_rounds_floor_enforced() {
        let mut config = AppConfig::default();
        config.agent.protected_rounds = 1;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("protected_rounds"));
    }

    #[test]
    fn thresholds_must_be_in_unit_interval() {
        let mut config = AppConfig::default();
        config.memory.cluster_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.reward.decay = -0.1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let result = AppConfig::load_from(Path::new("/nonexistent/config.toml"));
        assert!(result.is_ok());
        let config = result.unwrap();
        assert_eq!(config.default_provider, "openrouter");
    }

    #[test]
    fn default_toml_generation() {
        let toml_str = AppConfig::default_toml();
        assert!(toml_str.contains("openrouter"));
        assert!(toml_str.contains("[dispatch]"));
        assert!(toml_str.contains("[reward]"));
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
default_provider = "anthropic"

[agent]
context_limit_tokens = 9000

[dispatch]
pool_size = 8

[telemetry.custom_pricing."my-model"]
input_per_m = 1.0
output_per_m = 2.0
"#,
        )
        .unwrap();

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.default_provider, "anthropic");
        assert_eq!(config.agent.context_limit_tokens, 9000);
        assert_eq!(config.agent.protected_rounds, 2);
        assert_eq!(config.dispatch.pool_size, 8);
        assert_eq!(config.dispatch.max_retries, 3);
        let price = &config.telemetry.custom_pricing["my-model"];
        assert!(price.cached_input_per_m.is_none());
    }

    #[test]
    fn parse_error_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "default_provider = [").unwrap();
        let err = AppConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn debug_redacts_api_keys() {
        let mut config = AppConfig {
            api_key: Some("sk-secret-value".into()),
            ..AppConfig::default()
        };
        config.providers.insert(
            "openai".into(),
            ProviderConfig {
                api_key: Some("sk-other".into()),
                api_url: None,
                default_model: None,
            },
        );
        let debug = format!("{config:?}");
        assert!(!debug.contains("sk-secret-value"));
        assert!(!debug.contains("sk-other"));
        assert!(debug.contains("[REDACTED]"));
    }
}
