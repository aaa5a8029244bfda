//! Definitions an execution is bound to.

use sluice_core::dataset::Dataset;
use sluice_core::datasource::DataSource;
use sluice_core::ids::{DataSourceId, DatasetId};
use sluice_core::pipeline::{Pipeline, StageInput};
use sluice_core::ports::Repositories;
use sluice_core::{Error, Result};
use std::collections::HashMap;

/// The pipeline version plus every dataset and data source it references,
/// captured once when an execution starts. Later edits to the definitions
/// do not affect a running execution.
#[derive(Debug, Clone)]
pub struct ExecutionSnapshot {
    pub pipeline: Pipeline,
    pub datasets: HashMap<DatasetId, Dataset>,
    pub sources: HashMap<DataSourceId, DataSource>,
}

impl ExecutionSnapshot {
    pub async fn load(repos: &Repositories, pipeline: Pipeline) -> Result<Self> {
        let mut datasets = HashMap::new();
        let mut sources = HashMap::new();

        for id in pipeline.definition.referenced_datasets() {
            let dataset = repos.datasets.get(id).await?;
            if !sources.contains_key(&dataset.source_id) {
                let source = repos.data_sources.get(dataset.source_id).await?;
                sources.insert(source.id, source);
            }
            datasets.insert(id, dataset);
        }

        Ok(Self {
            pipeline,
            datasets,
            sources,
        })
    }

    pub fn dataset(&self, id: DatasetId) -> Result<&Dataset> {
        self.datasets
            .get(&id)
            .ok_or_else(|| Error::not_found("Dataset", id))
    }

    pub fn source(&self, dataset: &Dataset) -> Result<&DataSource> {
        self.sources
            .get(&dataset.source_id)
            .ok_or_else(|| Error::not_found("DataSource", dataset.source_id))
    }

    /// The dataset a stage input reads: the dataset itself, or the output
    /// dataset of the upstream stage.
    pub fn input_dataset(&self, input: &StageInput) -> Result<&Dataset> {
        match input {
            StageInput::Dataset(id) => self.dataset(*id),
            StageInput::Stage(stage) => {
                let upstream = self
                    .pipeline
                    .definition
                    .stage(stage)
                    .ok_or_else(|| Error::not_found("Stage", stage))?;
                self.dataset(upstream.output)
            }
        }
    }
}
