//! Configuration loading, validation, and management for HelloAgents.
//!
//! Loads configuration from `~/.helloagents/config.toml` with environment
//! variable overrides. Every field has a default, so a missing file or an
//! empty table is a valid configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.helloagents/config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// ReAct loop settings
    #[serde(default)]
    pub agent: AgentConfig,

    /// Context builder budget and selection settings
    #[serde(default)]
    pub context: ContextConfig,

    /// Terminal tool sandbox settings
    #[serde(default)]
    pub terminal: TerminalConfig,
}

/// ReAct loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_agent_name")]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    #[serde(default = "default_max_steps")]
    pub max_steps: usize,

    /// Observations longer than this (in chars) go through the summarizer.
    #[serde(default = "default_summarize_threshold")]
    pub summarize_threshold_chars: usize,

    #[serde(default = "default_true")]
    pub finalize_on_max_steps: bool,

    #[serde(default = "default_true")]
    pub early_stop_on_repeat: bool,

    #[serde(default = "default_repeat_threshold")]
    pub repeat_action_threshold: usize,

    /// Trace entries re-presented to the model each step.
    #[serde(default = "default_history_window")]
    pub history_window: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

fn default_agent_name() -> String {
    "helloagents".into()
}
fn default_max_steps() -> usize {
    20
}
fn default_summarize_threshold() -> usize {
    2000
}
fn default_repeat_threshold() -> usize {
    2
}
fn default_history_window() -> usize {
    24
}
fn default_true() -> bool {
    true
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: default_agent_name(),
            system_prompt: None,
            max_steps: default_max_steps(),
            summarize_threshold_chars: default_summarize_threshold(),
            finalize_on_max_steps: true,
            early_stop_on_repeat: true,
            repeat_action_threshold: default_repeat_threshold(),
            history_window: default_history_window(),
            temperature: None,
        }
    }
}

/// Context builder settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextConfig {
    #[serde(default = "default_context_max_tokens")]
    pub max_tokens: usize,

    /// Share of `max_tokens` held back for the model's reply.
    #[serde(default = "default_reserve_ratio")]
    pub reserve_ratio: f64,

    #[serde(default = "default_min_relevance")]
    pub min_relevance: f64,

    #[serde(default = "default_max_history_turns")]
    pub max_history_turns: usize,

    #[serde(default = "default_true")]
    pub enable_mmr: bool,

    #[serde(default = "default_mmr_lambda")]
    pub mmr_lambda: f64,

    #[serde(default = "default_true")]
    pub enable_compression: bool,

    #[serde(default = "default_true")]
    pub include_output_format: bool,

    #[serde(default = "default_true")]
    pub lazy_fetch: bool,

    /// HuggingFace `tokenizer.json` used when built with the `bpe` feature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokenizer_path: Option<PathBuf>,
}

fn default_context_max_tokens() -> usize {
    8000
}
fn default_reserve_ratio() -> f64 {
    0.15
}
fn default_min_relevance() -> f64 {
    0.3
}
fn default_max_history_turns() -> usize {
    10
}
fn default_mmr_lambda() -> f64 {
    0.7
}

impl ContextConfig {
    /// `floor(max_tokens * (1 - reserve_ratio))`
    pub fn available_tokens(&self) -> usize {
        (self.max_tokens as f64 * (1.0 - self.reserve_ratio)).floor() as usize
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_context_max_tokens(),
            reserve_ratio: default_reserve_ratio(),
            min_relevance: default_min_relevance(),
            max_history_turns: default_max_history_turns(),
            enable_mmr: true,
            mmr_lambda: default_mmr_lambda(),
            enable_compression: true,
            include_output_format: true,
            lazy_fetch: true,
            tokenizer_path: None,
        }
    }
}

/// Terminal tool settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalConfig {
    /// Root directory every path operation is confined to.
    #[serde(default = "default_workspace")]
    pub workspace: PathBuf,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    #[serde(default = "default_true")]
    pub allow_cd: bool,

    /// Ask before running commands that trip the dangerous-operation gate.
    #[serde(default)]
    pub confirm_dangerous: bool,

    #[serde(default)]
    pub default_shell_mode: bool,

    /// Register the `apply_patch` tool, which writes files in the workspace.
    #[serde(default)]
    pub enable_apply_patch: bool,
}

fn default_workspace() -> PathBuf {
    PathBuf::from(".")
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_output_bytes() -> usize {
    10 * 1024 * 1024
}

impl TerminalConfig {
    /// Defaults rooted at `workspace`.
    pub fn rooted_at(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
            ..Self::default()
        }
    }
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            workspace: default_workspace(),
            timeout_secs: default_timeout_secs(),
            max_output_bytes: default_max_output_bytes(),
            allow_cd: true,
            confirm_dangerous: false,
            default_shell_mode: false,
            enable_apply_patch: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.helloagents/config.toml),
    /// then apply environment overrides:
    /// - `HELLOAGENTS_WORKSPACE`
    /// - `HELLOAGENTS_MAX_STEPS`
    /// - `HELLOAGENTS_MAX_TOKENS`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
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

    /// Apply `HELLOAGENTS_*` overrides read through `lookup`.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(workspace) = lookup("HELLOAGENTS_WORKSPACE") {
            self.terminal.workspace = PathBuf::from(workspace);
        }
        if let Some(steps) = lookup("HELLOAGENTS_MAX_STEPS") {
            self.agent.max_steps = parse_override("HELLOAGENTS_MAX_STEPS", &steps)?;
        }
        if let Some(tokens) = lookup("HELLOAGENTS_MAX_TOKENS") {
            self.context.max_tokens = parse_override("HELLOAGENTS_MAX_TOKENS", &tokens)?;
        }
        self.validate()
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".helloagents")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let agent = &self.agent;
        if agent.max_steps == 0 {
            return Err(ConfigError::ValidationError("agent.max_steps must be >= 1".into()));
        }
        if agent.repeat_action_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "agent.repeat_action_threshold must be >= 1".into(),
            ));
        }
        if agent.history_window == 0 {
            return Err(ConfigError::ValidationError(
                "agent.history_window must be >= 1".into(),
            ));
        }

        let ctx = &self.context;
        if ctx.max_tokens == 0 {
            return Err(ConfigError::ValidationError("context.max_tokens must be > 0".into()));
        }
        if !(0.0..=0.5).contains(&ctx.reserve_ratio) {
            return Err(ConfigError::ValidationError(
                "context.reserve_ratio must be between 0.0 and 0.5".into(),
            ));
        }
        if !(0.0..=1.0).contains(&ctx.min_relevance) {
            return Err(ConfigError::ValidationError(
                "context.min_relevance must be between 0.0 and 1.0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&ctx.mmr_lambda) {
            return Err(ConfigError::ValidationError(
                "context.mmr_lambda must be between 0.0 and 1.0".into(),
            ));
        }

        if self.terminal.timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "terminal.timeout_secs must be > 0".into(),
            ));
        }
        if self.terminal.max_output_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "terminal.max_output_bytes must be > 0".into(),
            ));
        }

        Ok(())
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

fn parse_override<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::ValidationError(format!("{key} is not a valid number: {value}")))
}

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
