use serde::{Deserialize, Serialize};
use tracing::info;

use tessera_core::executor::ExecutionLimits;
use tessera_core::messages::ToolChoice;
use tessera_llm::RetryPolicy;

use crate::error::ConfigError;
use crate::truncate::DEFAULT_MAX_OUTPUT;

pub const ENV_MAX_CONCURRENT_AGENTS: &str = "TESSERA_MAX_CONCURRENT_AGENTS";
pub const ENV_MODEL: &str = "TESSERA_MODEL";
pub const ENV_MAX_RETRIES: &str = "TESSERA_MAX_RETRIES";

/// How the runner sets `tool_choice` on each request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoicePolicy {
    Auto,
    Required,
    /// `auto` on every turn except the last, which is `required`.
    #[default]
    RequiredOnLastTurn,
}

impl ToolChoicePolicy {
    pub fn choice_for(&self, turn: u32, max_turns: u32) -> ToolChoice {
        match self {
            Self::Auto => ToolChoice::Auto,
            Self::Required => ToolChoice::Required,
            Self::RequiredOnLastTurn if turn >= max_turns => ToolChoice::Required,
            Self::RequiredOnLastTurn => ToolChoice::Auto,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub model: String,
    /// Upper bound applied on top of each definition's own `max_turns`.
    pub max_turns: Option<u32>,
    pub tool_choice: ToolChoicePolicy,
    /// 0 disables trimming.
    pub max_history_messages: usize,
    pub dynamic_context: bool,
    pub working_context_size: usize,
    pub emit_payloads: bool,
    pub payload_max_chars: usize,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub max_tool_output: usize,
    pub retry: RetryPolicy,
    pub execution_limits: ExecutionLimits,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            model: "default".into(),
            max_turns: None,
            tool_choice: ToolChoicePolicy::default(),
            max_history_messages: 50,
            dynamic_context: true,
            working_context_size: 8,
            emit_payloads: false,
            payload_max_chars: 4_000,
            max_tokens: None,
            temperature: None,
            max_tool_output: DEFAULT_MAX_OUTPUT,
            retry: RetryPolicy::default(),
            execution_limits: ExecutionLimits::default(),
        }
    }
}

impl RunnerConfig {
    /// Turn budget for a definition allowing `definition_max` turns. Never below 1.
    pub fn effective_max_turns(&self, definition_max: u32) -> u32 {
        let cap = self.max_turns.unwrap_or(u32::MAX);
        definition_max.min(cap).max(1)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub max_concurrent_agents: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_agents: 4,
        }
    }
}

/// Top-level engine settings. Every field is optional in the JSON form.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub runner: RunnerConfig,
    pub coordinator: CoordinatorConfig,
}

impl EngineConfig {
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(s)?)
    }

    /// Apply `TESSERA_*` overrides from the process environment.
    pub fn apply_env(self) -> Result<Self, ConfigError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    pub fn apply_env_from<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_MAX_CONCURRENT_AGENTS) {
            let value: usize = parse_env(ENV_MAX_CONCURRENT_AGENTS, &raw)?;
            if value == 0 {
                return Err(ConfigError::InvalidEnv {
                    var: ENV_MAX_CONCURRENT_AGENTS.into(),
                    value: raw,
                });
            }
            info!(max_concurrent_agents = value, "config override from env");
            self.coordinator.max_concurrent_agents = value;
        }
        if let Some(model) = lookup(ENV_MODEL) {
            if !model.trim().is_empty() {
                info!(model = %model, "config override from env");
                self.runner.model = model.trim().to_string();
            }
        }
        if let Some(raw) = lookup(ENV_MAX_RETRIES) {
            let value: u32 = parse_env(ENV_MAX_RETRIES, &raw)?;
            info!(max_retries = value, "config override from env");
            self.runner.retry.max_retries = value;
        }
        Ok(self)
    }
}

fn parse_env<T: std::str::FromStr>(var: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        var: var.to_string(),
        value: raw.to_string(),
    })
}
