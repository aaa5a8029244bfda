//! In-memory implementation of ExecutionRepository.

use async_trait::async_trait;
use sluice_core::execution::{Execution, ExecutionFilter};
use sluice_core::ids::ExecutionId;
use sluice_core::ports::ExecutionRepository;
use sluice_core::{Error, Result};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Default)]
struct Table {
    /// Insertion order, which is also queue order.
    order: Vec<ExecutionId>,
    rows: HashMap<ExecutionId, Execution>,
}

#[derive(Default)]
pub struct MemExecutionRepository {
    table: RwLock<Table>,
}

impl MemExecutionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionRepository for MemExecutionRepository {
    async fn create(&self, execution: &Execution) -> Result<()> {
        let mut table = self.table.write().await;
        if table.rows.contains_key(&execution.id) {
            return Err(Error::Internal(format!(
                "execution {} already exists",
                execution.id
            )));
        }
        table.order.push(execution.id);
        table.rows.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn get(&self, id: ExecutionId) -> Result<Execution> {
        self.table
            .read()
            .await
            .rows
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("Execution", id))
    }

    async fn update(&self, execution: &Execution) -> Result<()> {
        let mut table = self.table.write().await;
        let row = table
            .rows
            .get_mut(&execution.id)
            .ok_or_else(|| Error::not_found("Execution", execution.id))?;
        // Terminal records are frozen.
        if row.is_terminal() {
            return Err(Error::AlreadyTerminal(execution.id.to_string()));
        }
        *row = execution.clone();
        Ok(())
    }

    async fn list(&self, filter: &ExecutionFilter) -> Result<Vec<Execution>> {
        let table = self.table.read().await;
        let matching = table
            .order
            .iter()
            .filter_map(|id| table.rows.get(id))
            .filter(|e| filter.matches(e))
            .cloned();
        Ok(match filter.limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        })
    }
}
