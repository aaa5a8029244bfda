//! Pipeline definition types.
//!
//! A pipeline is a DAG of stages. Each stage reads datasets or the outputs of
//! upstream stages, applies one transform, and writes one output dataset.

use crate::ids::{DatasetId, PipelineId, StageId};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PipelineDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub stages: Vec<StageDefinition>,
    /// Maximum number of executions of this pipeline that may run at once.
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,
    /// Execution-level retries after a retryable failure.
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub failure_mode: Option<FailureMode>,
}

fn default_concurrency() -> u32 {
    1
}

impl PipelineDefinition {
    pub fn stage(&self, id: &StageId) -> Option<&StageDefinition> {
        self.stages.iter().find(|s| &s.id == id)
    }

    /// Every dataset the pipeline reads or writes.
    pub fn referenced_datasets(&self) -> BTreeSet<DatasetId> {
        let mut out = BTreeSet::new();
        for stage in &self.stages {
            out.insert(stage.output);
            for input in &stage.inputs {
                if let StageInput::Dataset(id) = input {
                    out.insert(*id);
                }
            }
        }
        out
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StageDefinition {
    pub id: StageId,
    #[serde(default)]
    pub inputs: Vec<StageInput>,
    /// Ordering-only dependencies that do not feed data.
    #[serde(default)]
    pub depends_on: Vec<StageId>,
    pub transform: TransformSpec,
    pub output: DatasetId,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
    /// Output may be left in place after a failure and appended again on retry.
    #[serde(default)]
    pub append_safe: bool,
}

impl StageDefinition {
    /// Stages this stage must wait for, from both inputs and `depends_on`.
    pub fn upstream(&self) -> impl Iterator<Item = &StageId> {
        self.inputs
            .iter()
            .filter_map(|input| match input {
                StageInput::Stage(id) => Some(id),
                StageInput::Dataset(_) => None,
            })
            .chain(self.depends_on.iter())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StageInput {
    Dataset(DatasetId),
    /// The output dataset of another stage in the same pipeline.
    Stage(StageId),
}

/// The closed set of transform kinds a stage may declare.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransformSpec {
    Passthrough,
    Filter {
        field: String,
        equals: Value,
    },
    Project {
        fields: Vec<String>,
    },
    Rename {
        fields: HashMap<String, String>,
    },
    Deduplicate {
        key: Vec<String>,
    },
    /// A transform registered by name in the runner's registry.
    Custom {
        name: String,
        #[serde(default)]
        config: Value,
    },
}

impl TransformSpec {
    pub fn kind(&self) -> &str {
        match self {
            TransformSpec::Passthrough => "passthrough",
            TransformSpec::Filter { .. } => "filter",
            TransformSpec::Project { .. } => "project",
            TransformSpec::Rename { .. } => "rename",
            TransformSpec::Deduplicate { .. } => "deduplicate",
            TransformSpec::Custom { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub delay_ms: Option<u64>,
    #[serde(default)]
    pub max_delay_ms: Option<u64>,
}

fn default_max_retries() -> u32 {
    3
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Stop starting new stages after the first failure.
    #[default]
    FailFast,
    /// Keep running branches that do not depend on the failed stage.
    BestEffort,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Pipeline {
    pub id: PipelineId,
    pub name: String,
    pub version: u32,
    pub definition: PipelineDefinition,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
