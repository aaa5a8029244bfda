//! Span constructors for engine operations.

use std::fmt::Display;
use tracing::{Span, info_span};

/// Span covering one execution from admission to terminal status.
pub fn execution_span(
    pipeline_id: impl Display,
    pipeline_name: &str,
    pipeline_version: u32,
    execution_id: impl Display,
) -> Span {
    info_span!(
        "execution.run",
        sluice.pipeline.id = %pipeline_id,
        sluice.pipeline.name = pipeline_name,
        sluice.pipeline.version = pipeline_version,
        sluice.execution.id = %execution_id,
    )
}

/// Span covering one attempt of one stage.
pub fn stage_span(execution_id: impl Display, stage: impl Display, attempt: u32) -> Span {
    info_span!(
        "stage.run",
        sluice.execution.id = %execution_id,
        sluice.stage.id = %stage,
        sluice.stage.attempt = attempt,
    )
}

pub fn trigger_span(schedule_id: impl Display, pipeline_id: impl Display) -> Span {
    info_span!(
        "trigger.fire",
        sluice.schedule.id = %schedule_id,
        sluice.pipeline.id = %pipeline_id,
    )
}
