//! Agent Configuration
//!
//! Plain serde structs; every field has a default so partial configs
//! deserialize cleanly.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::provider::GenerationConfig;

/// Agent loop configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Model identifier sent with every request
    #[serde(default)]
    pub model: String,

    /// System prompt. Structured agents append the output schema to it.
    #[serde(default)]
    pub system_prompt: Option<String>,

    /// Maximum tool cycles before giving up
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    /// Abort the run on the first failed tool call instead of feeding the
    /// failure back to the model
    #[serde(default)]
    pub stop_on_tool_error: bool,

    #[serde(default)]
    pub generation: GenerationConfig,
}

fn default_max_iterations() -> usize {
    10
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            system_prompt: None,
            max_iterations: default_max_iterations(),
            stop_on_tool_error: false,
            generation: GenerationConfig::default(),
        }
    }
}

/// Retry policy for transport failures
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Growth factor between consecutive delays
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `retry` (zero-based)
    pub fn backoff(&self, retry: u32) -> Duration {
        let initial = Duration::from_millis(self.initial_delay_ms);
        let max = Duration::from_millis(self.max_delay_ms);
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let factor = self.multiplier.max(1.0).powi(exponent);

        Duration::try_from_secs_f64(initial.as_secs_f64() * factor).map_or(max, |delay| delay.min(max))
    }
}

/// Hard deadline for one provider call, retries included
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    120_000
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl TimeoutConfig {
    pub const fn duration(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
