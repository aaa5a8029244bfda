//! In-memory repository implementations.

mod dataset;
mod datasource;
mod execution;
mod pipeline;
mod schedule;

pub use dataset::MemDatasetRepository;
pub use datasource::MemDataSourceRepository;
pub use execution::MemExecutionRepository;
pub use pipeline::MemPipelineRepository;
pub use schedule::MemScheduleRepository;
