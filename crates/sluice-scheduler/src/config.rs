//! Engine configuration.

use serde::{Deserialize, Serialize};
use sluice_core::pipeline::FailureMode;
use sluice_trace::TracingConfig;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

impl From<ConfigError> for sluice_core::Error {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Io(e) => sluice_core::Error::Io(e),
            other => sluice_core::Error::Validation(other.to_string()),
        }
    }
}

/// Top-level engine configuration. Every field has a default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub orchestrator: OrchestratorConfig,
    pub triggers: TriggerConfig,
    pub logs: LogConfig,
    pub tracing: TracingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Executions running at once across all pipelines.
    pub execution_workers: usize,
    /// Stages running at once within one execution.
    pub stage_workers: usize,
    /// Waiting executions per pipeline before `Backpressure`.
    pub queue_capacity: usize,
    /// Stage retry budget for stages without their own policy.
    pub stage_retries: u32,
    /// Execution retry budget for pipelines without their own.
    pub execution_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_ceiling_ms: u64,
    pub stage_timeout_secs: u64,
    pub execution_timeout_secs: u64,
    pub cancel_grace_secs: u64,
    pub failure_mode: FailureMode,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            execution_workers: 8,
            stage_workers: 4,
            queue_capacity: 4,
            stage_retries: 3,
            execution_retries: 0,
            backoff_base_ms: 1_000,
            backoff_ceiling_ms: 60_000,
            stage_timeout_secs: 30 * 60,
            execution_timeout_secs: 2 * 60 * 60,
            cancel_grace_secs: 10,
            failure_mode: FailureMode::FailFast,
        }
    }
}

impl OrchestratorConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_ceiling(&self) -> Duration {
        Duration::from_millis(self.backoff_ceiling_ms)
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    pub tick_secs: u64,
    /// Most catch-up executions one `RunAll` schedule may emit at startup.
    pub catch_up_cap: usize,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            tick_secs: 30,
            catch_up_cap: 10,
        }
    }
}

impl TriggerConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub retention_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            retention_secs: 7 * 24 * 60 * 60,
            sweep_interval_secs: 5 * 60,
        }
    }
}

impl LogConfig {
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.retention_secs as i64)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl EngineConfig {
    /// Load from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let o = &self.orchestrator;
        if o.execution_workers == 0 || o.stage_workers == 0 {
            return Err(ConfigError::Invalid("worker pools must not be empty".into()));
        }
        if self.triggers.tick_secs == 0 {
            return Err(ConfigError::Invalid("tick_secs must be positive".into()));
        }
        if self.logs.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "sweep_interval_secs must be positive".into(),
            ));
        }
        if o.backoff_ceiling_ms < o.backoff_base_ms {
            return Err(ConfigError::Invalid(
                "backoff_ceiling_ms is below backoff_base_ms".into(),
            ));
        }
        Ok(())
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.triggers.tick_secs = tick.as_secs().max(1);
        self
    }

    pub fn with_catch_up_cap(mut self, cap: usize) -> Self {
        self.triggers.catch_up_cap = cap;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.orchestrator.queue_capacity = capacity;
        self
    }

    pub fn with_execution_workers(mut self, workers: usize) -> Self {
        self.orchestrator.execution_workers = workers;
        self
    }

    pub fn with_stage_workers(mut self, workers: usize) -> Self {
        self.orchestrator.stage_workers = workers;
        self
    }

    pub fn with_stage_retries(mut self, retries: u32) -> Self {
        self.orchestrator.stage_retries = retries;
        self
    }

    pub fn with_execution_retries(mut self, retries: u32) -> Self {
        self.orchestrator.execution_retries = retries;
        self
    }

    pub fn with_backoff(mut self, base: Duration, ceiling: Duration) -> Self {
        self.orchestrator.backoff_base_ms = base.as_millis() as u64;
        self.orchestrator.backoff_ceiling_ms = ceiling.as_millis() as u64;
        self
    }

    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.orchestrator.stage_timeout_secs = timeout.as_secs();
        self
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.orchestrator.execution_timeout_secs = timeout.as_secs();
        self
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.orchestrator.cancel_grace_secs = grace.as_secs();
        self
    }

    pub fn with_failure_mode(mut self, mode: FailureMode) -> Self {
        self.orchestrator.failure_mode = mode;
        self
    }

    pub fn with_log_retention(mut self, retention: Duration) -> Self {
        self.logs.retention_secs = retention.as_secs();
        self
    }
}
