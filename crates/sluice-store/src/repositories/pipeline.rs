//! In-memory implementation of PipelineRepository.

use async_trait::async_trait;
use sluice_core::ids::PipelineId;
use sluice_core::pipeline::{Pipeline, PipelineDefinition};
use sluice_core::ports::PipelineRepository;
use sluice_core::clock::{Clock, SystemClock};
use sluice_core::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Versions are append-only; the last entry of each history is the latest.
pub struct MemPipelineRepository {
    rows: RwLock<HashMap<PipelineId, Vec<Pipeline>>>,
    clock: Arc<dyn Clock>,
}

impl MemPipelineRepository {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            rows: RwLock::default(),
            clock,
        }
    }
}

impl Default for MemPipelineRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PipelineRepository for MemPipelineRepository {
    async fn create(&self, definition: &PipelineDefinition) -> Result<Pipeline> {
        let mut rows = self.rows.write().await;
        if rows
            .values()
            .filter_map(|versions| versions.last())
            .any(|p| p.name == definition.name)
        {
            return Err(Error::Validation(format!(
                "pipeline '{}' already exists",
                definition.name
            )));
        }

        let now = self.clock.now();
        let pipeline = Pipeline {
            id: PipelineId::new(),
            name: definition.name.clone(),
            version: 1,
            definition: definition.clone(),
            created_at: now,
            updated_at: now,
        };
        rows.insert(pipeline.id, vec![pipeline.clone()]);
        Ok(pipeline)
    }

    async fn get(&self, id: PipelineId) -> Result<Pipeline> {
        self.rows
            .read()
            .await
            .get(&id)
            .and_then(|versions| versions.last())
            .cloned()
            .ok_or_else(|| Error::not_found("Pipeline", id))
    }

    async fn get_version(&self, id: PipelineId, version: u32) -> Result<Pipeline> {
        self.rows
            .read()
            .await
            .get(&id)
            .and_then(|versions| versions.iter().find(|p| p.version == version))
            .cloned()
            .ok_or_else(|| Error::not_found("Pipeline version", format!("{id}@{version}")))
    }

    async fn get_by_name(&self, name: &str) -> Result<Pipeline> {
        self.rows
            .read()
            .await
            .values()
            .filter_map(|versions| versions.last())
            .find(|p| p.name == name)
            .cloned()
            .ok_or_else(|| Error::not_found("Pipeline", name))
    }

    async fn list(&self) -> Result<Vec<Pipeline>> {
        let mut pipelines: Vec<_> = self
            .rows
            .read()
            .await
            .values()
            .filter_map(|versions| versions.last().cloned())
            .collect();
        pipelines.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(pipelines)
    }

    async fn update(&self, id: PipelineId, definition: &PipelineDefinition) -> Result<Pipeline> {
        let mut rows = self.rows.write().await;
        let versions = rows
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("Pipeline", id))?;
        let latest = versions
            .last()
            .ok_or_else(|| Error::not_found("Pipeline", id))?;

        let next = Pipeline {
            id,
            name: definition.name.clone(),
            version: latest.version + 1,
            definition: definition.clone(),
            created_at: latest.created_at,
            updated_at: self.clock.now(),
        };
        versions.push(next.clone());
        Ok(next)
    }

    async fn delete(&self, id: PipelineId) -> Result<()> {
        self.rows
            .write()
            .await
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| Error::not_found("Pipeline", id))
    }
}
