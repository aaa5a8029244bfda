//! Data source definitions.

use crate::ids::DataSourceId;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// User-authored data source definition.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DataSourceDefinition {
    pub name: String,
    /// Connector type, e.g. `file`, `postgres`, `s3`.
    pub connector: String,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Unreachable,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DataSource {
    pub id: DataSourceId,
    pub name: String,
    pub connector: String,
    pub parameters: HashMap<String, String>,
    pub health: HealthStatus,
    pub health_checked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DataSource {
    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }
}
