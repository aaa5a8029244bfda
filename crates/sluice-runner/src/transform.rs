//! Record transforms applied by stages.
//!
//! Built-in transforms cover the closed set of [`TransformSpec`] variants.
//! `custom` transforms are looked up by name in a [`TransformRegistry`].

use serde_json::Value;
use sluice_core::pipeline::TransformSpec;
use sluice_core::record::{Record, RecordBatch};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("Unknown transform: {0}")]
    Unknown(String),
    #[error("Invalid configuration for transform '{name}': {reason}")]
    InvalidConfig { name: String, reason: String },
    #[error("Transform failed on record: {0}")]
    Record(String),
}

impl From<TransformError> for sluice_core::Error {
    fn from(err: TransformError) -> Self {
        match err {
            TransformError::Unknown(_) | TransformError::InvalidConfig { .. } => {
                sluice_core::Error::Validation(err.to_string())
            }
            TransformError::Record(reason) => sluice_core::Error::Schema(reason),
        }
    }
}

/// A transform instance, created fresh for each stage attempt.
///
/// Instances may keep state across the batches of one attempt.
pub trait Transform: Send {
    fn apply(&mut self, batch: RecordBatch) -> Result<RecordBatch, TransformError>;
}

impl<F> Transform for F
where
    F: FnMut(RecordBatch) -> Result<RecordBatch, TransformError> + Send,
{
    fn apply(&mut self, batch: RecordBatch) -> Result<RecordBatch, TransformError> {
        self(batch)
    }
}

struct Passthrough;

impl Transform for Passthrough {
    fn apply(&mut self, batch: RecordBatch) -> Result<RecordBatch, TransformError> {
        Ok(batch)
    }
}

struct Filter {
    field: String,
    equals: Value,
}

impl Transform for Filter {
    fn apply(&mut self, mut batch: RecordBatch) -> Result<RecordBatch, TransformError> {
        batch
            .records
            .retain(|record| record.get(&self.field) == Some(&self.equals));
        Ok(batch)
    }
}

struct Project {
    fields: Vec<String>,
}

impl Transform for Project {
    fn apply(&mut self, batch: RecordBatch) -> Result<RecordBatch, TransformError> {
        let records = batch
            .records
            .into_iter()
            .map(|mut record| {
                self.fields
                    .iter()
                    .filter_map(|field| record.remove_entry(field))
                    .collect::<Record>()
            })
            .collect();
        Ok(RecordBatch::new(records))
    }
}

struct Rename {
    fields: HashMap<String, String>,
}

impl Transform for Rename {
    fn apply(&mut self, mut batch: RecordBatch) -> Result<RecordBatch, TransformError> {
        for record in &mut batch.records {
            for (from, to) in &self.fields {
                if let Some(value) = record.remove(from) {
                    record.insert(to.clone(), value);
                }
            }
        }
        Ok(batch)
    }
}

/// Drops records whose key was already seen during this attempt.
struct Deduplicate {
    key: Vec<String>,
    seen: HashSet<String>,
}

impl Deduplicate {
    fn key_of(&self, record: &Record) -> Result<String, TransformError> {
        let encoded = if self.key.is_empty() {
            serde_json::to_string(record)
        } else {
            let parts: Vec<&Value> = self
                .key
                .iter()
                .map(|field| record.get(field).unwrap_or(&Value::Null))
                .collect();
            serde_json::to_string(&parts)
        };
        encoded.map_err(|e| TransformError::Record(e.to_string()))
    }
}

impl Transform for Deduplicate {
    fn apply(&mut self, batch: RecordBatch) -> Result<RecordBatch, TransformError> {
        let mut records = Vec::with_capacity(batch.len());
        for record in batch.records {
            let key = self.key_of(&record)?;
            if self.seen.insert(key) {
                records.push(record);
            }
        }
        Ok(RecordBatch::new(records))
    }
}

/// Builds a custom transform from its configuration value.
pub type TransformFactory =
    Arc<dyn Fn(&Value) -> Result<Box<dyn Transform>, TransformError> + Send + Sync>;

/// Built-in transforms plus named custom transforms.
#[derive(Clone, Default)]
pub struct TransformRegistry {
    custom: HashMap<String, TransformFactory>,
}

impl TransformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a custom transform under `name`, replacing any earlier one.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&Value) -> Result<Box<dyn Transform>, TransformError> + Send + Sync + 'static,
    {
        self.custom.insert(name.into(), Arc::new(factory));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.custom.contains_key(name)
    }

    /// Check that a spec can be built without building it.
    pub fn check(&self, spec: &TransformSpec) -> Result<(), TransformError> {
        match spec {
            TransformSpec::Custom { name, .. } if !self.contains(name) => {
                Err(TransformError::Unknown(name.clone()))
            }
            TransformSpec::Project { fields } if fields.is_empty() => {
                Err(TransformError::InvalidConfig {
                    name: spec.kind().to_string(),
                    reason: "no fields to project".into(),
                })
            }
            _ => Ok(()),
        }
    }

    pub fn build(&self, spec: &TransformSpec) -> Result<Box<dyn Transform>, TransformError> {
        self.check(spec)?;
        let transform: Box<dyn Transform> = match spec {
            TransformSpec::Passthrough => Box::new(Passthrough),
            TransformSpec::Filter { field, equals } => Box::new(Filter {
                field: field.clone(),
                equals: equals.clone(),
            }),
            TransformSpec::Project { fields } => Box::new(Project {
                fields: fields.clone(),
            }),
            TransformSpec::Rename { fields } => Box::new(Rename {
                fields: fields.clone(),
            }),
            TransformSpec::Deduplicate { key } => Box::new(Deduplicate {
                key: key.clone(),
                seen: HashSet::new(),
            }),
            TransformSpec::Custom { name, config } => {
                let factory = self
                    .custom
                    .get(name)
                    .ok_or_else(|| TransformError::Unknown(name.clone()))?;
                factory(config)?
            }
        };
        Ok(transform)
    }
}
