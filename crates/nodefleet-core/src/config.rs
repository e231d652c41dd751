//! Orchestrator configuration.
//!
//! Every field has a default, so an empty TOML document is a valid
//! configuration. Command-line flags override file values.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{FleetError, Result};

fn default_task_timeout_ms() -> u64 {
    30_000
}

fn default_startup_timeout_ms() -> u64 {
    5_000
}

fn default_heartbeat_timeout_ms() -> u64 {
    5_000
}

fn default_max_retry_backoff_ms() -> u64 {
    10_000
}

/// Settings shared by every coordination call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OrchestratorConfig {
    /// Per-node task timeout when the task does not set one
    #[serde(default = "default_task_timeout_ms")]
    pub task_timeout_ms: u64,

    /// Retry rounds for the failure subset when the task does not set one
    #[serde(default)]
    pub max_retries: u32,

    /// Per-node deadline for establishing a connection
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,

    /// Per-node deadline for a heartbeat ping
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,

    /// Delay before the first retry round; doubles each round (0 = none)
    #[serde(default)]
    pub retry_backoff_ms: u64,

    /// Cap on the retry delay
    #[serde(default = "default_max_retry_backoff_ms")]
    pub max_retry_backoff_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            task_timeout_ms: default_task_timeout_ms(),
            max_retries: 0,
            startup_timeout_ms: default_startup_timeout_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            retry_backoff_ms: 0,
            max_retry_backoff_ms: default_max_retry_backoff_ms(),
        }
    }
}

impl OrchestratorConfig {
    /// Parse configuration from a TOML string
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)
            .map_err(|e| FleetError::Config(format!("failed to parse TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            FleetError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&contents)
    }

    /// Reject values that would make every call fail
    pub fn validate(&self) -> Result<()> {
        if self.task_timeout_ms == 0 {
            return Err(FleetError::Config("task_timeout_ms must be greater than 0".into()));
        }
        if self.startup_timeout_ms == 0 {
            return Err(FleetError::Config("startup_timeout_ms must be greater than 0".into()));
        }
        if self.heartbeat_timeout_ms == 0 {
            return Err(FleetError::Config("heartbeat_timeout_ms must be greater than 0".into()));
        }
        if self.retry_backoff_ms > self.max_retry_backoff_ms {
            return Err(FleetError::Config(format!(
                "retry_backoff_ms ({}) exceeds max_retry_backoff_ms ({})",
                self.retry_backoff_ms, self.max_retry_backoff_ms
            )));
        }
        Ok(())
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    /// Delay before retry round `round` (1-based), with exponential growth
    pub fn retry_delay(&self, round: u32) -> Duration {
        if round == 0 || self.retry_backoff_ms == 0 {
            return Duration::ZERO;
        }
        let factor = 1u64.checked_shl(round - 1).unwrap_or(u64::MAX);
        let delay_ms = self
            .retry_backoff_ms
            .saturating_mul(factor)
            .min(self.max_retry_backoff_ms);
        Duration::from_millis(delay_ms)
    }
}
