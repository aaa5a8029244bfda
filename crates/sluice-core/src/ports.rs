//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the engine and external
//! adapters: definition persistence and data access.

use crate::Result;
use crate::dataset::{Dataset, DatasetDefinition};
use crate::datasource::{DataSource, DataSourceDefinition, HealthStatus};
use crate::execution::{Execution, ExecutionFilter};
use crate::ids::*;
use crate::pipeline::{Pipeline, PipelineDefinition};
use crate::record::RecordBatch;
use crate::schedule::{Schedule, ScheduleDefinition};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;

/// Lazy sequence of record batches read from a dataset.
pub type BatchStream = Pin<Box<dyn Stream<Item = Result<RecordBatch>> + Send>>;

/// Access to the records behind datasets.
#[async_trait]
pub trait DataAccess: Send + Sync {
    /// Open a lazy, restartable read of a dataset.
    async fn read(&self, source: &DataSource, dataset: &Dataset) -> Result<BatchStream>;

    /// Append a batch to a dataset.
    async fn write(&self, source: &DataSource, dataset: &Dataset, batch: RecordBatch)
    -> Result<()>;

    /// Remove every record from a dataset.
    async fn truncate(&self, source: &DataSource, dataset: &Dataset) -> Result<()>;

    /// Probe whether a data source can be reached.
    async fn test_connection(&self, source: &DataSource) -> HealthStatus;
}

/// Repository for data source definitions.
#[async_trait]
pub trait DataSourceRepository: Send + Sync {
    async fn create(&self, definition: &DataSourceDefinition) -> Result<DataSource>;

    /// Fails with `NotFound` when absent.
    async fn get(&self, id: DataSourceId) -> Result<DataSource>;

    async fn list(&self) -> Result<Vec<DataSource>>;

    async fn update(&self, id: DataSourceId, definition: &DataSourceDefinition)
    -> Result<DataSource>;

    /// Record the outcome of a connection test.
    async fn set_health(
        &self,
        id: DataSourceId,
        health: HealthStatus,
        checked_at: DateTime<Utc>,
    ) -> Result<()>;

    async fn delete(&self, id: DataSourceId) -> Result<()>;
}

/// Repository for dataset definitions. Edits create new versions.
#[async_trait]
pub trait DatasetRepository: Send + Sync {
    async fn create(&self, definition: &DatasetDefinition) -> Result<Dataset>;

    /// Latest version.
    async fn get(&self, id: DatasetId) -> Result<Dataset>;

    async fn get_version(&self, id: DatasetId, version: u32) -> Result<Dataset>;

    async fn list(&self) -> Result<Vec<Dataset>>;

    async fn update(&self, id: DatasetId, definition: &DatasetDefinition) -> Result<Dataset>;

    async fn delete(&self, id: DatasetId) -> Result<()>;
}

/// Repository for versioned pipeline definitions.
#[async_trait]
pub trait PipelineRepository: Send + Sync {
    /// Store a new pipeline at version 1.
    async fn create(&self, definition: &PipelineDefinition) -> Result<Pipeline>;

    /// Latest version.
    async fn get(&self, id: PipelineId) -> Result<Pipeline>;

    async fn get_version(&self, id: PipelineId, version: u32) -> Result<Pipeline>;

    async fn get_by_name(&self, name: &str) -> Result<Pipeline>;

    async fn list(&self) -> Result<Vec<Pipeline>>;

    /// Store a new version; earlier versions stay readable.
    async fn update(&self, id: PipelineId, definition: &PipelineDefinition) -> Result<Pipeline>;

    async fn delete(&self, id: PipelineId) -> Result<()>;
}

/// Repository for schedules.
#[async_trait]
pub trait ScheduleRepository: Send + Sync {
    async fn create(&self, definition: &ScheduleDefinition) -> Result<Schedule>;

    async fn get(&self, id: ScheduleId) -> Result<Schedule>;

    async fn list(&self) -> Result<Vec<Schedule>>;

    async fn update(&self, schedule: &Schedule) -> Result<()>;

    /// Advance the fire bookkeeping of an enabled schedule, leaving every
    /// other field as stored. Returns `false` without writing when the
    /// schedule is missing or disabled.
    async fn record_fire(
        &self,
        id: ScheduleId,
        fired_at: Option<DateTime<Utc>>,
        next_fire_at: Option<DateTime<Utc>>,
    ) -> Result<bool>;

    async fn delete(&self, id: ScheduleId) -> Result<()>;
}

/// Repository for execution records.
#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    async fn create(&self, execution: &Execution) -> Result<()>;

    async fn get(&self, id: ExecutionId) -> Result<Execution>;

    async fn update(&self, execution: &Execution) -> Result<()>;

    /// Matching executions, oldest first.
    async fn list(&self, filter: &ExecutionFilter) -> Result<Vec<Execution>>;
}

/// The set of repositories the engine reads and writes.
#[derive(Clone)]
pub struct Repositories {
    pub data_sources: Arc<dyn DataSourceRepository>,
    pub datasets: Arc<dyn DatasetRepository>,
    pub pipelines: Arc<dyn PipelineRepository>,
    pub schedules: Arc<dyn ScheduleRepository>,
    pub executions: Arc<dyn ExecutionRepository>,
}
