//! In-memory data access with fault injection.

use async_trait::async_trait;
use futures::StreamExt;
use sluice_core::dataset::Dataset;
use sluice_core::datasource::{DataSource, HealthStatus};
use sluice_core::ids::{DataSourceId, DatasetId};
use sluice_core::ports::{BatchStream, DataAccess};
use sluice_core::record::{Record, RecordBatch};
use sluice_core::{Error, Result};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[derive(Default)]
struct State {
    tables: HashMap<DatasetId, Vec<Record>>,
    /// Sources that fail connection tests; `None` fails forever.
    unreachable: HashMap<DataSourceId, Option<u32>>,
    connection_attempts: HashMap<DataSourceId, Vec<Instant>>,
    /// Fail reads of a dataset after this many batches.
    read_faults: HashMap<DatasetId, usize>,
}

/// Datasets held in memory, read back in fixed-size batches.
pub struct MemoryDataAccess {
    state: Mutex<State>,
    batch_size: usize,
    read_delay: Option<Duration>,
}

impl Default for MemoryDataAccess {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDataAccess {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            batch_size: 100,
            read_delay: None,
        }
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Sleep before yielding each batch.
    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = Some(delay);
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert(&self, dataset: DatasetId, records: Vec<Record>) {
        self.state().tables.entry(dataset).or_default().extend(records);
    }

    pub fn records(&self, dataset: DatasetId) -> Vec<Record> {
        self.state().tables.get(&dataset).cloned().unwrap_or_default()
    }

    /// Make connection tests for a source fail, `times` times or forever.
    pub fn set_unreachable(&self, source: DataSourceId, times: Option<u32>) {
        self.state().unreachable.insert(source, times);
    }

    /// Fail reads of a dataset after `after_batches` batches were yielded.
    pub fn fail_reads_after(&self, dataset: DatasetId, after_batches: usize) {
        self.state().read_faults.insert(dataset, after_batches);
    }

    /// When each connection test against the source happened.
    pub fn connection_attempts(&self, source: DataSourceId) -> Vec<Instant> {
        self.state()
            .connection_attempts
            .get(&source)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl DataAccess for MemoryDataAccess {
    async fn read(&self, _source: &DataSource, dataset: &Dataset) -> Result<BatchStream> {
        let (records, fail_after) = {
            let state = self.state();
            (
                state.tables.get(&dataset.id).cloned().unwrap_or_default(),
                state.read_faults.get(&dataset.id).copied(),
            )
        };
        let delay = self.read_delay;
        let name = dataset.name.clone();

        let batches = RecordBatch::new(records).chunks(self.batch_size);
        let stream = futures::stream::iter(batches.into_iter().enumerate()).then(
            move |(index, batch)| {
                let name = name.clone();
                async move {
                    if let Some(delay) = delay {
                        tokio::time::sleep(delay).await;
                    }
                    match fail_after {
                        Some(limit) if index >= limit => {
                            Err(Error::Io(std::io::Error::other(format!(
                                "read of '{name}' interrupted"
                            ))))
                        }
                        _ => Ok(batch),
                    }
                }
            },
        );
        Ok(Box::pin(stream))
    }

    async fn write(
        &self,
        _source: &DataSource,
        dataset: &Dataset,
        batch: RecordBatch,
    ) -> Result<()> {
        debug!(dataset = %dataset.name, records = batch.len(), "Writing batch");
        self.insert(dataset.id, batch.records);
        Ok(())
    }

    async fn truncate(&self, _source: &DataSource, dataset: &Dataset) -> Result<()> {
        self.state().tables.remove(&dataset.id);
        Ok(())
    }

    async fn test_connection(&self, source: &DataSource) -> HealthStatus {
        let mut state = self.state();
        state
            .connection_attempts
            .entry(source.id)
            .or_default()
            .push(Instant::now());

        match state.unreachable.get(&source.id).copied() {
            None => HealthStatus::Healthy,
            Some(None) => HealthStatus::Unreachable,
            Some(Some(0)) => {
                state.unreachable.remove(&source.id);
                HealthStatus::Healthy
            }
            Some(Some(remaining)) => {
                state.unreachable.insert(source.id, Some(remaining - 1));
                HealthStatus::Unreachable
            }
        }
    }
}
