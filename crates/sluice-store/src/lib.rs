//! Storage adapters for Sluice.
//!
//! In-memory implementations of every persistence port, plus data access
//! adapters for in-memory and newline-delimited JSON file datasets.

pub mod data;
pub mod files;
pub mod repositories;

pub use data::MemoryDataAccess;
pub use files::FileDataAccess;
pub use repositories::*;

use sluice_core::clock::{Clock, SystemClock};
use sluice_core::ports::Repositories;
use std::sync::Arc;

/// Build a full set of in-memory repositories stamped by the wall clock.
pub fn memory_repositories() -> Repositories {
    memory_repositories_with_clock(Arc::new(SystemClock))
}

/// Build a full set of in-memory repositories stamped by `clock`.
pub fn memory_repositories_with_clock(clock: Arc<dyn Clock>) -> Repositories {
    Repositories {
        data_sources: Arc::new(MemDataSourceRepository::with_clock(clock.clone())),
        datasets: Arc::new(MemDatasetRepository::with_clock(clock.clone())),
        pipelines: Arc::new(MemPipelineRepository::with_clock(clock.clone())),
        schedules: Arc::new(MemScheduleRepository::with_clock(clock)),
        executions: Arc::new(MemExecutionRepository::new()),
    }
}
