//! Project files.
//!
//! A project is one YAML document declaring data sources, datasets,
//! pipelines and schedules. Entities refer to each other by name; loading a
//! project into an engine creates them in dependency order and resolves the
//! names to ids.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sluice_core::dataset::{DatasetCategory, DatasetDefinition, SchemaDescriptor};
use sluice_core::datasource::DataSourceDefinition;
use sluice_core::ids::{DataSourceId, DatasetId, PipelineId, ScheduleId, StageId};
use sluice_core::pipeline::{
    FailureMode, PipelineDefinition, RetryConfig, StageDefinition, StageInput, TransformSpec,
};
use sluice_core::schedule::{CatchUpPolicy, ScheduleDefinition};
use sluice_scheduler::Engine;
use sluice_store::files::FILE_CONNECTOR;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProjectError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("Duplicate {kind} '{name}'")]
    Duplicate { kind: &'static str, name: String },
    #[error("Dataset '{dataset}' references unknown data source '{source_name}'")]
    UnknownDataSource { dataset: String, source_name: String },
    #[error("Stage '{stage}' of pipeline '{pipeline}' references unknown dataset '{name}'")]
    UnknownDataset {
        pipeline: String,
        stage: String,
        name: String,
    },
    #[error("Unknown pipeline '{0}'")]
    UnknownPipeline(String),
    #[error(transparent)]
    Engine(#[from] sluice_core::Error),
}

/// Root of a project file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ProjectFile {
    #[serde(default)]
    pub data_sources: Vec<DataSourceDefinition>,
    #[serde(default)]
    pub datasets: Vec<ProjectDataset>,
    #[serde(default)]
    pub pipelines: Vec<ProjectPipeline>,
    #[serde(default)]
    pub schedules: Vec<ProjectSchedule>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ProjectDataset {
    pub name: String,
    /// Data source name.
    pub source: String,
    #[serde(default)]
    pub category: DatasetCategory,
    #[serde(default)]
    pub schema: SchemaDescriptor,
    #[serde(default)]
    pub location: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ProjectPipeline {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub stages: Vec<ProjectStage>,
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,
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

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ProjectStage {
    pub id: String,
    #[serde(default)]
    pub inputs: Vec<ProjectInput>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub transform: TransformSpec,
    /// Output dataset name.
    pub output: String,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
    #[serde(default)]
    pub append_safe: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ProjectInput {
    /// Dataset name.
    Dataset(String),
    /// Id of an upstream stage.
    Stage(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ProjectSchedule {
    /// Pipeline name.
    pub pipeline: String,
    pub expression: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub catch_up: CatchUpPolicy,
}

fn default_enabled() -> bool {
    true
}

/// A parsed project together with the directory it was read from.
#[derive(Debug, Clone)]
pub struct Project {
    pub file: ProjectFile,
    pub base_dir: PathBuf,
}

/// Ids of the entities a project created.
#[derive(Debug, Default)]
pub struct Installed {
    pub pipelines: HashMap<String, PipelineId>,
    pub schedules: Vec<ScheduleId>,
}

impl Installed {
    pub fn pipeline(&self, name: &str) -> Result<PipelineId, ProjectError> {
        self.pipelines
            .get(name)
            .copied()
            .ok_or_else(|| ProjectError::UnknownPipeline(name.to_string()))
    }
}

impl Project {
    pub fn load(path: &Path) -> Result<Self, ProjectError> {
        let content = std::fs::read_to_string(path).map_err(|source| ProjectError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let file = serde_yaml::from_str(&content).map_err(|source| ProjectError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Ok(Self { file, base_dir })
    }

    /// Create every entity in `engine`. Pipelines are validated on the way in.
    pub async fn install(&self, engine: &Engine) -> Result<Installed, ProjectError> {
        let repos = engine.repositories();

        let mut sources: HashMap<&str, DataSourceId> = HashMap::new();
        for definition in &self.file.data_sources {
            if sources.contains_key(definition.name.as_str()) {
                return Err(duplicate("data source", &definition.name));
            }
            let source = repos
                .data_sources
                .create(&self.resolve_source(definition))
                .await?;
            sources.insert(definition.name.as_str(), source.id);
        }

        let mut datasets: HashMap<&str, DatasetId> = HashMap::new();
        for dataset in &self.file.datasets {
            if datasets.contains_key(dataset.name.as_str()) {
                return Err(duplicate("dataset", &dataset.name));
            }
            let source_id = *sources.get(dataset.source.as_str()).ok_or_else(|| {
                ProjectError::UnknownDataSource {
                    dataset: dataset.name.clone(),
                    source_name: dataset.source.clone(),
                }
            })?;
            let created = repos
                .datasets
                .create(&DatasetDefinition {
                    name: dataset.name.clone(),
                    source_id,
                    category: dataset.category,
                    schema: dataset.schema.clone(),
                    location: dataset.location.clone(),
                })
                .await?;
            datasets.insert(dataset.name.as_str(), created.id);
        }

        let mut installed = Installed::default();
        for pipeline in &self.file.pipelines {
            if installed.pipelines.contains_key(&pipeline.name) {
                return Err(duplicate("pipeline", &pipeline.name));
            }
            let definition = pipeline_definition(pipeline, &datasets)?;
            let created = engine.create_pipeline(&definition).await?;
            installed.pipelines.insert(pipeline.name.clone(), created.id);
        }

        for schedule in &self.file.schedules {
            let pipeline_id = installed.pipeline(&schedule.pipeline)?;
            let created = engine
                .register_schedule(&ScheduleDefinition {
                    pipeline_id,
                    expression: schedule.expression.clone(),
                    enabled: schedule.enabled,
                    catch_up: schedule.catch_up,
                })
                .await?;
            installed.schedules.push(created.id);
        }

        Ok(installed)
    }

    /// File sources with a relative `path` are anchored at the project
    /// directory.
    fn resolve_source(&self, definition: &DataSourceDefinition) -> DataSourceDefinition {
        let mut resolved = definition.clone();
        if resolved.connector == FILE_CONNECTOR
            && let Some(path) = resolved.parameters.get_mut("path")
            && Path::new(path.as_str()).is_relative()
        {
            *path = self.base_dir.join(path.as_str()).to_string_lossy().into_owned();
        }
        resolved
    }
}

fn duplicate(kind: &'static str, name: &str) -> ProjectError {
    ProjectError::Duplicate {
        kind,
        name: name.to_string(),
    }
}

fn pipeline_definition(
    pipeline: &ProjectPipeline,
    datasets: &HashMap<&str, DatasetId>,
) -> Result<PipelineDefinition, ProjectError> {
    let lookup = |stage: &ProjectStage, name: &str| {
        datasets
            .get(name)
            .copied()
            .ok_or_else(|| ProjectError::UnknownDataset {
                pipeline: pipeline.name.clone(),
                stage: stage.id.clone(),
                name: name.to_string(),
            })
    };

    let mut stages = Vec::with_capacity(pipeline.stages.len());
    for stage in &pipeline.stages {
        let inputs = stage
            .inputs
            .iter()
            .map(|input| match input {
                ProjectInput::Dataset(name) => lookup(stage, name).map(StageInput::Dataset),
                ProjectInput::Stage(id) => Ok(StageInput::Stage(StageId::new(id.as_str()))),
            })
            .collect::<Result<Vec<_>, _>>()?;

        stages.push(StageDefinition {
            id: StageId::new(stage.id.as_str()),
            inputs,
            depends_on: stage
                .depends_on
                .iter()
                .map(|id| StageId::new(id.as_str()))
                .collect(),
            transform: stage.transform.clone(),
            output: lookup(stage, &stage.output)?,
            timeout_seconds: stage.timeout_seconds,
            retry: stage.retry.clone(),
            append_safe: stage.append_safe,
        });
    }

    Ok(PipelineDefinition {
        name: pipeline.name.clone(),
        description: pipeline.description.clone(),
        stages,
        concurrency: pipeline.concurrency,
        max_retries: pipeline.max_retries,
        timeout_seconds: pipeline.timeout_seconds,
        failure_mode: pipeline.failure_mode,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sluice_core::Error;
    use sluice_store::{FileDataAccess, memory_repositories};
    use std::sync::Arc;

    const PROJECT: &str = r#"
data_sources:
  - name: local
    connector: file
    parameters:
      path: data
datasets:
  - name: raw_orders
    source: local
  - name: paid_orders
    source: local
    category: curated
pipelines:
  - name: orders
    stages:
      - id: extract
        inputs:
          - dataset: raw_orders
        transform:
          kind: filter
          field: status
          equals: paid
        output: paid_orders
schedules:
  - pipeline: orders
    expression: "*/15 * * * *"
    catch_up: run_once
"#;

    fn engine() -> Engine {
        Engine::builder(memory_repositories(), Arc::new(FileDataAccess::default()))
            .build()
            .unwrap()
    }

    fn write_project(content: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sluice.yaml");
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[tokio::test]
    async fn test_install_resolves_names() {
        let (dir, path) = write_project(PROJECT);
        let project = Project::load(&path).unwrap();
        let engine = engine();

        let installed = project.install(&engine).await.unwrap();
        let pipeline_id = installed.pipeline("orders").unwrap();
        assert_eq!(installed.schedules.len(), 1);

        let repos = engine.repositories();
        let pipeline = repos.pipelines.get(pipeline_id).await.unwrap();
        let raw = repos
            .datasets
            .list()
            .await
            .unwrap()
            .into_iter()
            .find(|d| d.name == "raw_orders")
            .unwrap();
        assert_eq!(
            pipeline.definition.stages[0].inputs,
            vec![StageInput::Dataset(raw.id)]
        );

        let source = repos.data_sources.get(raw.source_id).await.unwrap();
        assert_eq!(
            source.parameter("path").map(PathBuf::from),
            Some(dir.path().join("data"))
        );

        let schedule = repos.schedules.get(installed.schedules[0]).await.unwrap();
        assert_eq!(schedule.pipeline_id, pipeline_id);
        assert_eq!(schedule.catch_up, CatchUpPolicy::RunOnce);
        assert!(schedule.next_fire_at.is_some());
    }

    #[tokio::test]
    async fn test_unknown_dataset_name() {
        let (_dir, path) = write_project(&PROJECT.replace("output: paid_orders", "output: nope"));
        let err = Project::load(&path)
            .unwrap()
            .install(&engine())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProjectError::UnknownDataset { ref name, .. } if name == "nope"
        ));
    }

    #[tokio::test]
    async fn test_cycle_is_reported() {
        let content = PROJECT.replace(
            "        output: paid_orders\n",
            "        depends_on: [load]\n        output: paid_orders\n      - id: load\n        inputs:\n          - stage: extract\n        transform:\n          kind: passthrough\n        output: raw_orders\n",
        );
        let (_dir, path) = write_project(&content);
        let err = Project::load(&path)
            .unwrap()
            .install(&engine())
            .await
            .unwrap_err();
        assert!(matches!(err, ProjectError::Engine(Error::Cycle(_))));
    }

    #[tokio::test]
    async fn test_schedule_for_unknown_pipeline() {
        let (_dir, path) = write_project(&PROJECT.replace("- pipeline: orders", "- pipeline: billing"));
        let err = Project::load(&path)
            .unwrap()
            .install(&engine())
            .await
            .unwrap_err();
        assert!(matches!(err, ProjectError::UnknownPipeline(ref name) if name == "billing"));
    }

    #[test]
    fn test_parse_error_names_file() {
        let (_dir, path) = write_project("pipelines: {");
        let err = Project::load(&path).unwrap_err();
        assert!(err.to_string().contains("sluice.yaml"));
    }
}
