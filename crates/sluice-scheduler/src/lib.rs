//! Sluice Scheduler
//!
//! Turns schedules and manual requests into executions and drives them:
//! stage graph resolution, cron triggers with catch-up, admission control,
//! retries, cancellation and timeouts. [`Engine`] is the entry point.

pub mod backoff;
pub mod config;
pub mod dag;
pub mod engine;
pub mod orchestrator;
pub mod queue;
pub mod triggers;

pub use config::{ConfigError, EngineConfig, LogConfig, OrchestratorConfig, TriggerConfig};
pub use dag::{DagError, DagResolver, ExecutionPlan};
pub use engine::{Engine, EngineBuilder};
pub use orchestrator::{Orchestrator, ShutdownPolicy};
pub use triggers::{ExecutionSubmitter, TriggerEngine, TriggerExpression};
