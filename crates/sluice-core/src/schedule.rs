//! Time-based schedules attached to pipelines.

use crate::ids::{PipelineId, ScheduleId};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ScheduleDefinition {
    pub pipeline_id: PipelineId,
    /// Cron expression: `min hour day-of-month month day-of-week`.
    pub expression: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub catch_up: CatchUpPolicy,
}

fn default_enabled() -> bool {
    true
}

/// How fires missed while the engine was down are reconciled at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CatchUpPolicy {
    /// Drop missed fires.
    #[default]
    Skip,
    /// One execution covering every missed fire.
    RunOnce,
    /// One execution per missed fire, oldest first, up to the configured cap.
    RunAll,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Schedule {
    pub id: ScheduleId,
    pub pipeline_id: PipelineId,
    pub expression: String,
    pub enabled: bool,
    pub catch_up: CatchUpPolicy,
    /// Cached next fire time. `None` while disabled.
    pub next_fire_at: Option<DateTime<Utc>>,
    pub last_fired_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
