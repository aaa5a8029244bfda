//! Execution and stage state types.

use crate::ids::{ExecutionId, PipelineId, ScheduleId, StageId};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Execution {
    pub id: ExecutionId,
    pub pipeline_id: PipelineId,
    pub pipeline_name: String,
    pub pipeline_version: u32,
    /// `None` for manual runs.
    pub schedule_id: Option<ScheduleId>,
    pub trigger: TriggerKind,
    /// The fire time this execution stands for, when schedule-triggered.
    pub scheduled_for: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    /// Keyed by exactly the stage set of the bound pipeline version.
    pub stages: BTreeMap<StageId, StageState>,
    pub retry_count: u32,
    pub error_summary: Option<String>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Execution {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn duration_ms(&self) -> Option<u64> {
        let started = self.started_at?;
        let completed = self.completed_at?;
        Some((completed - started).num_milliseconds().max(0) as u64)
    }

    pub fn stage_status(&self, stage: &StageId) -> Option<StageStatus> {
        self.stages.get(stage).map(|s| s.status)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    /// Waiting out backoff before re-entering `Running`.
    Retrying,
    Succeeded,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Succeeded | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Manual,
    Schedule,
    CatchUp,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct StageState {
    pub status: StageStatus,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
    Skipped,
}

impl StageStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StageStatus::Pending | StageStatus::Running)
    }
}

/// A request to run a pipeline, from a manual submit or a schedule fire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    pub pipeline_id: PipelineId,
    /// Pin a version; `None` runs the latest.
    pub version: Option<u32>,
    pub schedule_id: Option<ScheduleId>,
    pub trigger: TriggerKind,
    pub scheduled_for: Option<DateTime<Utc>>,
}

impl ExecutionRequest {
    pub fn manual(pipeline_id: PipelineId, version: Option<u32>) -> Self {
        Self {
            pipeline_id,
            version,
            schedule_id: None,
            trigger: TriggerKind::Manual,
            scheduled_for: None,
        }
    }

    pub fn scheduled(
        pipeline_id: PipelineId,
        schedule_id: ScheduleId,
        fire_at: DateTime<Utc>,
        trigger: TriggerKind,
    ) -> Self {
        Self {
            pipeline_id,
            version: None,
            schedule_id: Some(schedule_id),
            trigger,
            scheduled_for: Some(fire_at),
        }
    }
}

/// Filter for listing executions. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub pipeline_id: Option<PipelineId>,
    pub schedule_id: Option<ScheduleId>,
    pub statuses: Vec<ExecutionStatus>,
    pub limit: Option<usize>,
}

impl ExecutionFilter {
    pub fn pipeline(pipeline_id: PipelineId) -> Self {
        Self {
            pipeline_id: Some(pipeline_id),
            ..Default::default()
        }
    }

    pub fn with_statuses(mut self, statuses: impl IntoIterator<Item = ExecutionStatus>) -> Self {
        self.statuses = statuses.into_iter().collect();
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, execution: &Execution) -> bool {
        self.pipeline_id.is_none_or(|id| id == execution.pipeline_id)
            && self
                .schedule_id
                .is_none_or(|id| Some(id) == execution.schedule_id)
            && (self.statuses.is_empty() || self.statuses.contains(&execution.status))
    }
}
