//! Dataset definitions and schema descriptors.

use crate::ids::{DataSourceId, DatasetId};
use crate::record::Record;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DatasetDefinition {
    pub name: String,
    pub source_id: DataSourceId,
    #[serde(default)]
    pub category: DatasetCategory,
    #[serde(default)]
    pub schema: SchemaDescriptor,
    /// Connector-specific location, e.g. a table name or file path.
    #[serde(default)]
    pub location: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DatasetCategory {
    #[default]
    Raw,
    Staging,
    Curated,
    Reference,
}

/// Field list describing the records a dataset holds.
///
/// An empty descriptor accepts any record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SchemaDescriptor {
    #[serde(default)]
    pub fields: Vec<FieldDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FieldDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default = "default_true")]
    pub nullable: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Integer,
    Float,
    Boolean,
    Timestamp,
    Json,
}

impl FieldType {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldType::String | FieldType::Timestamp => value.is_string(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_number(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Json => true,
        }
    }
}

impl SchemaDescriptor {
    /// Check a record against the descriptor, returning the first mismatch.
    pub fn check(&self, record: &Record) -> Result<(), String> {
        for field in &self.fields {
            match record.get(&field.name) {
                None | Some(Value::Null) if !field.nullable => {
                    return Err(format!("field '{}' is required", field.name));
                }
                None | Some(Value::Null) => {}
                Some(value) if !field.field_type.accepts(value) => {
                    return Err(format!(
                        "field '{}' expected {:?}, got {}",
                        field.name, field.field_type, value
                    ));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Dataset {
    pub id: DatasetId,
    pub name: String,
    /// Bumped on every edit; executions snapshot the version they started with.
    pub version: u32,
    pub source_id: DataSourceId,
    pub category: DatasetCategory,
    pub schema: SchemaDescriptor,
    pub location: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Dataset {
    /// Location inside the data source, defaulting to the dataset name.
    pub fn location(&self) -> &str {
        self.location.as_deref().unwrap_or(&self.name)
    }
}
