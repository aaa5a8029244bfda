//! Record batches exchanged between data access and transforms.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single record: a JSON object keyed by field name.
pub type Record = Map<String, Value>;

/// A bounded group of records read or written in one data-access call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordBatch {
    pub records: Vec<Record>,
}

impl RecordBatch {
    pub fn new(records: Vec<Record>) -> Self {
        Self { records }
    }

    /// Build a batch from JSON values, keeping only objects.
    pub fn from_values(values: impl IntoIterator<Item = Value>) -> Self {
        Self {
            records: values
                .into_iter()
                .filter_map(|v| match v {
                    Value::Object(map) => Some(map),
                    _ => None,
                })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Split into chunks of at most `size` records.
    pub fn chunks(self, size: usize) -> Vec<RecordBatch> {
        let size = size.max(1);
        let mut out = Vec::new();
        let mut current = Vec::with_capacity(size.min(self.records.len()));
        for record in self.records {
            current.push(record);
            if current.len() == size {
                out.push(RecordBatch::new(std::mem::take(&mut current)));
            }
        }
        if !current.is_empty() {
            out.push(RecordBatch::new(current));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_values_drops_non_objects() {
        let batch = RecordBatch::from_values(vec![json!({"a": 1}), json!(3), json!({"a": 2})]);
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn test_chunks() {
        let batch = RecordBatch::from_values((0..5).map(|i| json!({ "i": i })));
        let chunks = batch.chunks(2);
        assert_eq!(chunks.iter().map(RecordBatch::len).collect::<Vec<_>>(), vec![2, 2, 1]);
    }
}
