//! Newline-delimited JSON datasets on the local filesystem.
//!
//! A `file` data source names a directory in its `path` parameter; each
//! dataset is the file `<path>/<location>.ndjson`.

use async_stream::try_stream;
use async_trait::async_trait;
use sluice_core::dataset::Dataset;
use sluice_core::datasource::{DataSource, HealthStatus};
use sluice_core::ports::{BatchStream, DataAccess};
use sluice_core::record::{Record, RecordBatch};
use sluice_core::{Error, Result};
use std::path::PathBuf;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

pub const FILE_CONNECTOR: &str = "file";

pub struct FileDataAccess {
    batch_size: usize,
}

impl Default for FileDataAccess {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl FileDataAccess {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }

    fn root(source: &DataSource) -> Result<PathBuf> {
        if source.connector != FILE_CONNECTOR {
            return Err(Error::Validation(format!(
                "data source '{}' uses connector '{}', expected '{}'",
                source.name, source.connector, FILE_CONNECTOR
            )));
        }
        source
            .parameter("path")
            .map(PathBuf::from)
            .ok_or_else(|| {
                Error::Validation(format!("data source '{}' has no 'path'", source.name))
            })
    }

    fn dataset_path(source: &DataSource, dataset: &Dataset) -> Result<PathBuf> {
        Ok(Self::root(source)?.join(format!("{}.ndjson", dataset.location())))
    }
}

#[async_trait]
impl DataAccess for FileDataAccess {
    async fn read(&self, source: &DataSource, dataset: &Dataset) -> Result<BatchStream> {
        let path = Self::dataset_path(source, dataset)?;
        let batch_size = self.batch_size;

        let stream = try_stream! {
            let file = match tokio::fs::File::open(&path).await {
                Ok(file) => Some(file),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                Err(e) => Err(Error::Io(e))?,
            };

            if let Some(file) = file {
                let mut lines = BufReader::new(file).lines();
                let mut records: Vec<Record> = Vec::with_capacity(batch_size);
                while let Some(line) = lines.next_line().await? {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let record: Record = serde_json::from_str(line)
                        .map_err(|e| Error::Schema(format!("{}: {}", path.display(), e)))?;
                    records.push(record);
                    if records.len() == batch_size {
                        yield RecordBatch::new(std::mem::take(&mut records));
                    }
                }
                if !records.is_empty() {
                    yield RecordBatch::new(records);
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn write(&self, source: &DataSource, dataset: &Dataset, batch: RecordBatch) -> Result<()> {
        let path = Self::dataset_path(source, dataset)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut buf = Vec::new();
        for record in &batch.records {
            serde_json::to_writer(&mut buf, record)?;
            buf.push(b'\n');
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(&buf).await?;
        file.flush().await?;
        debug!(path = %path.display(), records = batch.len(), "Appended batch");
        Ok(())
    }

    async fn truncate(&self, source: &DataSource, dataset: &Dataset) -> Result<()> {
        let path = Self::dataset_path(source, dataset)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn test_connection(&self, source: &DataSource) -> HealthStatus {
        let root = match Self::root(source) {
            Ok(root) => root,
            Err(e) => {
                warn!(source = %source.name, error = %e, "Invalid file data source");
                return HealthStatus::Unreachable;
            }
        };
        match tokio::fs::metadata(&root).await {
            Ok(meta) if meta.is_dir() => HealthStatus::Healthy,
            _ => HealthStatus::Unreachable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use futures::StreamExt;
    use serde_json::json;
    use sluice_core::dataset::DatasetCategory;
    use sluice_core::ids::{DataSourceId, DatasetId};
    use std::collections::HashMap;

    fn source(dir: &std::path::Path) -> DataSource {
        DataSource {
            id: DataSourceId::new(),
            name: "lake".into(),
            connector: FILE_CONNECTOR.into(),
            parameters: HashMap::from([("path".to_string(), dir.display().to_string())]),
            health: HealthStatus::Unknown,
            health_checked_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn dataset(source: &DataSource) -> Dataset {
        Dataset {
            id: DatasetId::new(),
            name: "orders".into(),
            version: 1,
            source_id: source.id,
            category: DatasetCategory::Raw,
            schema: Default::default(),
            location: Some("raw/orders".into()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_write_then_read_batches() {
        let dir = tempfile::tempdir().unwrap();
        let access = FileDataAccess::new(2);
        let src = source(dir.path());
        let ds = dataset(&src);

        let batch = RecordBatch::from_values((0..3).map(|i| json!({ "id": i })));
        access.write(&src, &ds, batch).await.unwrap();
        assert!(dir.path().join("raw/orders.ndjson").exists());

        let batches: Vec<_> = access.read(&src, &ds).await.unwrap().collect().await;
        let sizes: Vec<_> = batches.into_iter().map(|b| b.unwrap().len()).collect();
        assert_eq!(sizes, vec![2, 1]);

        access.truncate(&src, &ds).await.unwrap();
        let batches: Vec<_> = access.read(&src, &ds).await.unwrap().collect().await;
        assert!(batches.is_empty());
    }

    #[tokio::test]
    async fn test_connection_requires_directory() {
        let dir = tempfile::tempdir().unwrap();
        let access = FileDataAccess::default();
        assert_eq!(
            access.test_connection(&source(dir.path())).await,
            HealthStatus::Healthy
        );
        assert_eq!(
            access
                .test_connection(&source(&dir.path().join("missing")))
                .await,
            HealthStatus::Unreachable
        );
    }

    #[tokio::test]
    async fn test_malformed_line_is_schema_error() {
        let dir = tempfile::tempdir().unwrap();
        let access = FileDataAccess::default();
        let src = source(dir.path());
        let ds = dataset(&src);
        tokio::fs::create_dir_all(dir.path().join("raw")).await.unwrap();
        tokio::fs::write(dir.path().join("raw/orders.ndjson"), "{\"id\":1}\nnot json\n")
            .await
            .unwrap();

        let results: Vec<_> = access.read(&src, &ds).await.unwrap().collect().await;
        assert!(matches!(results.last(), Some(Err(Error::Schema(_)))));
    }
}
