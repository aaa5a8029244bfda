//! In-memory implementation of DataSourceRepository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sluice_core::datasource::{DataSource, DataSourceDefinition, HealthStatus};
use sluice_core::ids::DataSourceId;
use sluice_core::ports::DataSourceRepository;
use sluice_core::clock::{Clock, SystemClock};
use sluice_core::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

pub struct MemDataSourceRepository {
    rows: RwLock<HashMap<DataSourceId, DataSource>>,
    clock: Arc<dyn Clock>,
}

impl MemDataSourceRepository {
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

impl Default for MemDataSourceRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DataSourceRepository for MemDataSourceRepository {
    async fn create(&self, definition: &DataSourceDefinition) -> Result<DataSource> {
        let mut rows = self.rows.write().await;
        if rows.values().any(|s| s.name == definition.name) {
            return Err(Error::Validation(format!(
                "data source '{}' already exists",
                definition.name
            )));
        }

        let now = self.clock.now();
        let source = DataSource {
            id: DataSourceId::new(),
            name: definition.name.clone(),
            connector: definition.connector.clone(),
            parameters: definition.parameters.clone(),
            health: HealthStatus::Unknown,
            health_checked_at: None,
            created_at: now,
            updated_at: now,
        };
        rows.insert(source.id, source.clone());
        Ok(source)
    }

    async fn get(&self, id: DataSourceId) -> Result<DataSource> {
        self.rows
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("Data source", id))
    }

    async fn list(&self) -> Result<Vec<DataSource>> {
        let mut sources: Vec<_> = self.rows.read().await.values().cloned().collect();
        sources.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(sources)
    }

    async fn update(
        &self,
        id: DataSourceId,
        definition: &DataSourceDefinition,
    ) -> Result<DataSource> {
        let mut rows = self.rows.write().await;
        let source = rows
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("Data source", id))?;
        source.name = definition.name.clone();
        source.connector = definition.connector.clone();
        source.parameters = definition.parameters.clone();
        source.health = HealthStatus::Unknown;
        source.updated_at = self.clock.now();
        Ok(source.clone())
    }

    async fn set_health(
        &self,
        id: DataSourceId,
        health: HealthStatus,
        checked_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut rows = self.rows.write().await;
        let source = rows
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("Data source", id))?;
        source.health = health;
        source.health_checked_at = Some(checked_at);
        Ok(())
    }

    async fn delete(&self, id: DataSourceId) -> Result<()> {
        self.rows
            .write()
            .await
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| Error::not_found("Data source", id))
    }
}
