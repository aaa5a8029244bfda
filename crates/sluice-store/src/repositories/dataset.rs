//! In-memory implementation of DatasetRepository.

use async_trait::async_trait;
use sluice_core::dataset::{Dataset, DatasetDefinition};
use sluice_core::ids::DatasetId;
use sluice_core::ports::DatasetRepository;
use sluice_core::clock::{Clock, SystemClock};
use sluice_core::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Keeps every version of every dataset; the last entry is the latest.
pub struct MemDatasetRepository {
    rows: RwLock<HashMap<DatasetId, Vec<Dataset>>>,
    clock: Arc<dyn Clock>,
}

impl MemDatasetRepository {
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

impl Default for MemDatasetRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DatasetRepository for MemDatasetRepository {
    async fn create(&self, definition: &DatasetDefinition) -> Result<Dataset> {
        let mut rows = self.rows.write().await;
        if rows
            .values()
            .filter_map(|versions| versions.last())
            .any(|d| d.name == definition.name)
        {
            return Err(Error::Validation(format!(
                "dataset '{}' already exists",
                definition.name
            )));
        }

        let now = self.clock.now();
        let dataset = Dataset {
            id: DatasetId::new(),
            name: definition.name.clone(),
            version: 1,
            source_id: definition.source_id,
            category: definition.category,
            schema: definition.schema.clone(),
            location: definition.location.clone(),
            created_at: now,
            updated_at: now,
        };
        rows.insert(dataset.id, vec![dataset.clone()]);
        Ok(dataset)
    }

    async fn get(&self, id: DatasetId) -> Result<Dataset> {
        self.rows
            .read()
            .await
            .get(&id)
            .and_then(|versions| versions.last())
            .cloned()
            .ok_or_else(|| Error::not_found("Dataset", id))
    }

    async fn get_version(&self, id: DatasetId, version: u32) -> Result<Dataset> {
        self.rows
            .read()
            .await
            .get(&id)
            .and_then(|versions| versions.iter().find(|d| d.version == version))
            .cloned()
            .ok_or_else(|| Error::not_found("Dataset version", format!("{id}@{version}")))
    }

    async fn list(&self) -> Result<Vec<Dataset>> {
        let mut datasets: Vec<_> = self
            .rows
            .read()
            .await
            .values()
            .filter_map(|versions| versions.last().cloned())
            .collect();
        datasets.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(datasets)
    }

    async fn update(&self, id: DatasetId, definition: &DatasetDefinition) -> Result<Dataset> {
        let mut rows = self.rows.write().await;
        let versions = rows
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("Dataset", id))?;
        let latest = versions
            .last()
            .ok_or_else(|| Error::not_found("Dataset", id))?;

        let next = Dataset {
            id,
            name: definition.name.clone(),
            version: latest.version + 1,
            source_id: definition.source_id,
            category: definition.category,
            schema: definition.schema.clone(),
            location: definition.location.clone(),
            created_at: latest.created_at,
            updated_at: self.clock.now(),
        };
        versions.push(next.clone());
        Ok(next)
    }

    async fn delete(&self, id: DatasetId) -> Result<()> {
        self.rows
            .write()
            .await
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| Error::not_found("Dataset", id))
    }
}
