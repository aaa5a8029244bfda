//! Stage execution for Sluice.
//!
//! A stage attempt tests the connections it needs, streams its inputs batch
//! by batch through a transform, checks each output record against the
//! target schema and writes it out.

pub mod runner;
pub mod snapshot;
pub mod transform;

pub use runner::{
    DatasetStepRunner, RunnerConfig, StageContext, StageOutcome, StageStats, StepRunner,
};
pub use snapshot::ExecutionSnapshot;
pub use transform::{Transform, TransformError, TransformFactory, TransformRegistry};
