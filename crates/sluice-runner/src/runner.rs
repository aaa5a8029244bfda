//! Stage execution against the data access port.

use crate::snapshot::ExecutionSnapshot;
use crate::transform::{TransformError, TransformRegistry};
use async_trait::async_trait;
use futures::StreamExt;
use sluice_core::clock::Clock;
use sluice_core::dataset::Dataset;
use sluice_core::datasource::{DataSource, HealthStatus};
use sluice_core::execution::StageStatus;
use sluice_core::ids::ExecutionId;
use sluice_core::pipeline::StageDefinition;
use sluice_core::ports::{DataAccess, DataSourceRepository};
use sluice_core::{Error, Result};
use sluice_logs::ExecutionLogSink;
use sluice_trace::stage_span;
use std::sync::Arc;
use tokio::time::{Duration, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, warn};

/// Everything one stage attempt needs.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub execution_id: ExecutionId,
    pub stage: StageDefinition,
    /// 1-based attempt number.
    pub attempt: u32,
    pub snapshot: Arc<ExecutionSnapshot>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageStats {
    pub batches: u64,
    pub records_read: u64,
    pub records_written: u64,
}

/// Terminal result of one stage attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    Succeeded(StageStats),
    Failed { reason: String, retryable: bool },
    TimedOut { seconds: u64 },
    Cancelled,
}

impl StageOutcome {
    pub fn failed(err: &Error) -> Self {
        StageOutcome::Failed {
            reason: err.to_string(),
            retryable: err.is_retryable(),
        }
    }

    pub fn status(&self) -> StageStatus {
        match self {
            StageOutcome::Succeeded(_) => StageStatus::Succeeded,
            StageOutcome::Failed { .. } => StageStatus::Failed,
            StageOutcome::TimedOut { .. } => StageStatus::TimedOut,
            StageOutcome::Cancelled => StageStatus::Cancelled,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, StageOutcome::Failed { retryable: true, .. })
    }
}

/// Runs stage attempts.
#[async_trait]
pub trait StepRunner: Send + Sync {
    /// Run one attempt of a stage to a terminal outcome.
    ///
    /// `cancel` is observed at I/O checkpoints; an implementation that
    /// never reaches one is force-terminated by the caller.
    async fn run(&self, ctx: &StageContext, cancel: CancellationToken) -> StageOutcome;
}

/// Configuration for stage execution.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Applies to stages without their own timeout.
    pub stage_timeout: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            stage_timeout: Duration::from_secs(30 * 60),
        }
    }
}

enum Halt {
    Cancelled,
    Failed(Error),
}

impl From<Error> for Halt {
    fn from(err: Error) -> Self {
        Halt::Failed(err)
    }
}

impl From<TransformError> for Halt {
    fn from(err: TransformError) -> Self {
        Halt::Failed(err.into())
    }
}

/// Step runner that streams input datasets through a transform into the
/// stage's output dataset.
///
/// Non-append-safe stages replace their target: it is truncated before the
/// first write and again if the attempt does not succeed.
pub struct DatasetStepRunner {
    data: Arc<dyn DataAccess>,
    data_sources: Arc<dyn DataSourceRepository>,
    transforms: Arc<TransformRegistry>,
    logs: Arc<ExecutionLogSink>,
    clock: Arc<dyn Clock>,
    config: RunnerConfig,
}

impl DatasetStepRunner {
    pub fn new(
        data: Arc<dyn DataAccess>,
        data_sources: Arc<dyn DataSourceRepository>,
        transforms: Arc<TransformRegistry>,
        logs: Arc<ExecutionLogSink>,
        clock: Arc<dyn Clock>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            data,
            data_sources,
            transforms,
            logs,
            clock,
            config,
        }
    }

    /// Test every source and record its health. Fails on the first
    /// unreachable one.
    async fn check_connections(&self, sources: &[&DataSource]) -> Result<()> {
        for source in sources {
            let health = self.data.test_connection(source).await;
            if let Err(e) = self
                .data_sources
                .set_health(source.id, health, self.clock.now())
                .await
            {
                warn!(source = %source.name, error = %e, "Failed to record data source health");
            }
            if health == HealthStatus::Unreachable {
                return Err(Error::Connection(source.name.clone()));
            }
        }
        Ok(())
    }

    async fn execute(
        &self,
        ctx: &StageContext,
        cancel: &CancellationToken,
        stats: &mut StageStats,
    ) -> std::result::Result<(), Halt> {
        let snapshot = &ctx.snapshot;
        let output = snapshot.dataset(ctx.stage.output)?;
        let output_source = snapshot.source(output)?;

        let mut inputs: Vec<(&Dataset, &DataSource)> = Vec::with_capacity(ctx.stage.inputs.len());
        for input in &ctx.stage.inputs {
            let dataset = snapshot.input_dataset(input)?;
            inputs.push((dataset, snapshot.source(dataset)?));
        }

        let mut touched: Vec<&DataSource> = Vec::new();
        for source in inputs.iter().map(|(_, s)| *s).chain([output_source]) {
            if !touched.iter().any(|t| t.id == source.id) {
                touched.push(source);
            }
        }
        self.check_connections(&touched).await?;

        let mut transform = self.transforms.build(&ctx.stage.transform)?;

        if !ctx.stage.append_safe {
            self.data.truncate(output_source, output).await?;
        }

        for (dataset, source) in inputs {
            if cancel.is_cancelled() {
                return Err(Halt::Cancelled);
            }
            debug!(stage = %ctx.stage.id, dataset = %dataset.name, "Reading input");
            let mut batches = self.data.read(source, dataset).await?;

            loop {
                if cancel.is_cancelled() {
                    return Err(Halt::Cancelled);
                }
                let Some(batch) = batches.next().await else {
                    break;
                };
                let batch = batch?;
                stats.batches += 1;
                stats.records_read += batch.len() as u64;

                let out = transform.apply(batch)?;
                for record in &out.records {
                    output
                        .schema
                        .check(record)
                        .map_err(|reason| Error::Schema(format!("{}: {}", output.name, reason)))?;
                }
                if out.is_empty() {
                    continue;
                }
                if cancel.is_cancelled() {
                    return Err(Halt::Cancelled);
                }
                let written = out.len() as u64;
                self.data.write(output_source, output, out).await?;
                stats.records_written += written;
            }
        }

        Ok(())
    }

    /// Remove partial output of an attempt that did not succeed.
    async fn discard(&self, ctx: &StageContext, stats: &StageStats) {
        if stats.records_written == 0 {
            return;
        }
        if ctx.stage.append_safe {
            self.logs.warn(
                ctx.execution_id,
                Some(&ctx.stage.id),
                format!(
                    "Keeping {} records written by the interrupted attempt",
                    stats.records_written
                ),
            );
            return;
        }

        let target = ctx
            .snapshot
            .dataset(ctx.stage.output)
            .and_then(|ds| Ok((ds, ctx.snapshot.source(ds)?)));
        let result = match target {
            Ok((dataset, source)) => self.data.truncate(source, dataset).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => self.logs.info(
                ctx.execution_id,
                Some(&ctx.stage.id),
                format!("Discarded {} partial records", stats.records_written),
            ),
            Err(e) => {
                warn!(stage = %ctx.stage.id, error = %e, "Failed to discard partial output");
                self.logs.error(
                    ctx.execution_id,
                    Some(&ctx.stage.id),
                    format!("Failed to discard partial output: {e}"),
                );
            }
        }
    }
}

#[async_trait]
impl StepRunner for DatasetStepRunner {
    async fn run(&self, ctx: &StageContext, cancel: CancellationToken) -> StageOutcome {
        let limit = ctx
            .stage
            .timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(self.config.stage_timeout);
        let stage = Some(&ctx.stage.id);

        self.logs.info(
            ctx.execution_id,
            stage,
            format!(
                "Starting attempt {} ({} transform)",
                ctx.attempt,
                ctx.stage.transform.kind()
            ),
        );

        let mut stats = StageStats::default();
        let span = stage_span(ctx.execution_id, &ctx.stage.id, ctx.attempt);
        let result = timeout(limit, self.execute(ctx, &cancel, &mut stats))
            .instrument(span)
            .await;

        let outcome = match result {
            Ok(Ok(())) => StageOutcome::Succeeded(stats),
            Ok(Err(Halt::Cancelled)) => StageOutcome::Cancelled,
            Ok(Err(Halt::Failed(e))) => StageOutcome::failed(&e),
            Err(_) => StageOutcome::TimedOut {
                seconds: limit.as_secs(),
            },
        };

        match &outcome {
            StageOutcome::Succeeded(stats) => {
                info!(
                    execution_id = %ctx.execution_id,
                    stage = %ctx.stage.id,
                    records_read = stats.records_read,
                    records_written = stats.records_written,
                    "Stage attempt succeeded"
                );
                self.logs.info(
                    ctx.execution_id,
                    stage,
                    format!(
                        "Read {} records in {} batches, wrote {}",
                        stats.records_read, stats.batches, stats.records_written
                    ),
                );
            }
            StageOutcome::Failed { reason, retryable } => {
                warn!(
                    execution_id = %ctx.execution_id,
                    stage = %ctx.stage.id,
                    retryable,
                    error = %reason,
                    "Stage attempt failed"
                );
                self.logs.error(ctx.execution_id, stage, reason.clone());
            }
            StageOutcome::TimedOut { seconds } => {
                warn!(execution_id = %ctx.execution_id, stage = %ctx.stage.id, seconds, "Stage timed out");
                self.logs
                    .error(ctx.execution_id, stage, format!("Timed out after {seconds}s"));
            }
            StageOutcome::Cancelled => {
                self.logs.warn(ctx.execution_id, stage, "Cancelled");
            }
        }

        if !matches!(outcome, StageOutcome::Succeeded(_)) {
            self.discard(ctx, &stats).await;
        }
        outcome
    }
}
