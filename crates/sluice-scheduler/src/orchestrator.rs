//! Execution orchestration.
//!
//! Each admitted execution is driven on the shared worker pool: its plan is
//! resolved once, stages start in topological order as their upstreams
//! succeed, and independent stages run concurrently up to the per-execution
//! stage pool. Stage-level retries happen inside the stage task; an
//! execution-level retry re-runs only the stages that did not succeed.

use crate::backoff::Backoff;
use crate::config::OrchestratorConfig;
use crate::dag::{DagResolver, ExecutionPlan};
use crate::queue::{Admission, AdmissionQueue};
use crate::triggers::ExecutionSubmitter;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::FutureExt;
use sluice_core::clock::Clock;
use sluice_core::execution::{
    Execution, ExecutionRequest, ExecutionStatus, StageState, StageStatus,
};
use sluice_core::ids::{DatasetId, ExecutionId, PipelineId, StageId};
use sluice_core::pipeline::{FailureMode, Pipeline, StageDefinition};
use sluice_core::ports::Repositories;
use sluice_core::{Error, Result};
use sluice_logs::ExecutionLogSink;
use sluice_runner::{ExecutionSnapshot, StageContext, StageOutcome, StepRunner};
use sluice_trace::execution_span;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{Duration, Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info, warn};

/// What happens to in-flight executions on shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPolicy {
    /// Stop admitting, let running and queued executions finish.
    Drain,
    /// Stop admitting, cancel everything not yet terminal.
    Cancel,
}

struct ActiveExecution {
    pipeline_id: PipelineId,
    cancel: CancellationToken,
}

/// Terminal result of a stage within one pass, after its own retries.
struct StageReport {
    index: usize,
    attempts: u32,
    outcome: StageOutcome,
}

enum PassResult {
    Succeeded,
    Failed { summary: String, retryable: bool },
    Cancelled,
    TimedOut,
}

/// One stage of one execution, with its retry policy resolved.
struct StageJob {
    execution_id: ExecutionId,
    stage: StageDefinition,
    snapshot: Arc<ExecutionSnapshot>,
    index: usize,
    first_attempt: u32,
    budget: u32,
    backoff: Backoff,
    runner: Arc<dyn StepRunner>,
    logs: Arc<ExecutionLogSink>,
}

impl StageJob {
    /// Run attempts until one succeeds, fails fatally, or the retry budget
    /// is spent.
    async fn run(self, cancel: CancellationToken) -> StageReport {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let ctx = StageContext {
                execution_id: self.execution_id,
                stage: self.stage.clone(),
                attempt: self.first_attempt + attempts - 1,
                snapshot: self.snapshot.clone(),
            };
            let outcome = AssertUnwindSafe(self.runner.run(&ctx, cancel.clone()))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| StageOutcome::Failed {
                    reason: "stage runner panicked".into(),
                    retryable: false,
                });

            if !outcome.is_retryable() || attempts > self.budget || cancel.is_cancelled() {
                return StageReport {
                    index: self.index,
                    attempts,
                    outcome,
                };
            }

            let delay = self.backoff.delay(attempts);
            self.logs.warn(
                self.execution_id,
                Some(&self.stage.id),
                format!(
                    "Retrying in {}ms (retry {attempts} of {})",
                    delay.as_millis(),
                    self.budget
                ),
            );
            tokio::select! {
                _ = sleep(delay) => {}
                _ = cancel.cancelled() => {
                    return StageReport {
                        index: self.index,
                        attempts,
                        outcome: StageOutcome::Cancelled,
                    };
                }
            }
        }
    }
}

/// Admits, drives, retries and cancels executions.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    repos: Repositories,
    resolver: DagResolver,
    runner: Arc<dyn StepRunner>,
    logs: Arc<ExecutionLogSink>,
    clock: Arc<dyn Clock>,
    config: OrchestratorConfig,
    /// The only shared slot counter; admission and completion both lock it.
    admission: Mutex<AdmissionQueue>,
    workers: Arc<Semaphore>,
    active: DashMap<ExecutionId, ActiveExecution>,
    tracker: TaskTracker,
    accepting: AtomicBool,
}

impl Inner {
    async fn plan(&self, pipeline: &Pipeline) -> Result<Arc<ExecutionPlan>> {
        let known: HashSet<DatasetId> = self
            .repos
            .datasets
            .list()
            .await?
            .into_iter()
            .map(|d| d.id)
            .collect();
        Ok(self.resolver.resolve(pipeline, &known)?)
    }

    fn backoff(&self) -> Backoff {
        Backoff::new(self.config.backoff_base(), self.config.backoff_ceiling())
    }
}

impl Orchestrator {
    pub fn new(
        repos: Repositories,
        runner: Arc<dyn StepRunner>,
        logs: Arc<ExecutionLogSink>,
        clock: Arc<dyn Clock>,
        config: OrchestratorConfig,
    ) -> Self {
        let admission = AdmissionQueue::new(config.queue_capacity);
        let workers = Arc::new(Semaphore::new(config.execution_workers.max(1)));
        Self {
            inner: Arc::new(Inner {
                repos,
                resolver: DagResolver::new(),
                runner,
                logs,
                clock,
                config,
                admission: Mutex::new(admission),
                workers,
                active: DashMap::new(),
                tracker: TaskTracker::new(),
                accepting: AtomicBool::new(true),
            }),
        }
    }

    /// Executions admitted or queued and not yet terminal.
    pub fn in_flight(&self) -> usize {
        self.inner.active.len()
    }

    /// Create an execution and admit or queue it.
    ///
    /// Fails with `NotFound` for an unknown pipeline or version and with
    /// `Backpressure` when the pipeline's admission queue is full. Rejected
    /// requests leave no execution record behind.
    pub async fn submit(&self, request: ExecutionRequest) -> Result<ExecutionId> {
        let inner = &self.inner;
        if !inner.accepting.load(Ordering::SeqCst) {
            return Err(Error::Internal("orchestrator is shutting down".into()));
        }

        let pipeline = match request.version {
            Some(version) => {
                inner
                    .repos
                    .pipelines
                    .get_version(request.pipeline_id, version)
                    .await?
            }
            None => inner.repos.pipelines.get(request.pipeline_id).await?,
        };
        let plan = inner.plan(&pipeline).await?;

        let execution = Execution {
            id: ExecutionId::new(),
            pipeline_id: pipeline.id,
            pipeline_name: pipeline.name.clone(),
            pipeline_version: pipeline.version,
            schedule_id: request.schedule_id,
            trigger: request.trigger,
            scheduled_for: request.scheduled_for,
            status: ExecutionStatus::Pending,
            stages: plan
                .order()
                .map(|id| (id.clone(), StageState::default()))
                .collect(),
            retry_count: 0,
            error_summary: None,
            queued_at: inner.clock.now(),
            started_at: None,
            completed_at: None,
        };
        let limit = pipeline.definition.concurrency as usize;

        let admission = {
            let mut queue = inner.admission.lock().await;
            let admission = queue.admit(pipeline.id, limit, execution.id)?;
            if let Err(e) = inner.repos.executions.create(&execution).await {
                match admission {
                    Admission::Start => {
                        queue.release(pipeline.id);
                    }
                    Admission::Queued { .. } => {
                        queue.withdraw(pipeline.id, execution.id);
                    }
                }
                return Err(e);
            }
            inner.active.insert(
                execution.id,
                ActiveExecution {
                    pipeline_id: pipeline.id,
                    cancel: CancellationToken::new(),
                },
            );
            inner.logs.open(execution.id);
            admission
        };

        match admission {
            Admission::Start => {
                info!(
                    execution_id = %execution.id,
                    pipeline = %pipeline.name,
                    version = pipeline.version,
                    trigger = ?execution.trigger,
                    "Admitted execution"
                );
                inner.logs.info(
                    execution.id,
                    None,
                    format!("Admitted {} version {}", pipeline.name, pipeline.version),
                );
                self.dispatch(execution.id, pipeline.id);
            }
            Admission::Queued { position } => {
                info!(
                    execution_id = %execution.id,
                    pipeline = %pipeline.name,
                    position,
                    "Queued execution"
                );
                inner.logs.info(
                    execution.id,
                    None,
                    format!("Queued at position {position} behind running executions"),
                );
            }
        }

        Ok(execution.id)
    }

    /// Request cancellation. A no-op for terminal executions.
    ///
    /// Queued executions are cancelled on the spot; running ones stop at
    /// their next checkpoint or are force-terminated after the grace period.
    pub async fn cancel(&self, execution_id: ExecutionId) -> Result<()> {
        let inner = &self.inner;
        let execution = inner.repos.executions.get(execution_id).await?;
        if execution.is_terminal() {
            debug!(execution_id = %execution_id, status = ?execution.status, "Cancel ignored for terminal execution");
            return Ok(());
        }
        let Some((pipeline_id, token)) = inner
            .active
            .get(&execution_id)
            .map(|a| (a.pipeline_id, a.cancel.clone()))
        else {
            return Ok(());
        };

        info!(execution_id = %execution_id, "Cancelling execution");
        inner.logs.warn(execution_id, None, "Cancellation requested");
        token.cancel();

        let withdrawn = inner.admission.lock().await.withdraw(pipeline_id, execution_id);
        if withdrawn {
            self.abandon(execution).await;
        }
        Ok(())
    }

    /// Stop admitting and wind down per `policy`. Returns once every
    /// execution task has finished.
    pub async fn shutdown(&self, policy: ShutdownPolicy) {
        let inner = &self.inner;
        inner.accepting.store(false, Ordering::SeqCst);
        info!(?policy, in_flight = inner.active.len(), "Shutting down orchestrator");

        if policy == ShutdownPolicy::Cancel {
            let waiting = inner.admission.lock().await.drain_waiting();
            for (_, execution_id) in waiting {
                match inner.repos.executions.get(execution_id).await {
                    Ok(execution) => self.abandon(execution).await,
                    Err(e) => {
                        error!(execution_id = %execution_id, error = %e, "Failed to load queued execution");
                        inner.active.remove(&execution_id);
                    }
                }
            }
            for entry in inner.active.iter() {
                entry.cancel.cancel();
            }
        }

        inner.tracker.close();
        inner.tracker.wait().await;
        info!("Orchestrator stopped");
    }

    /// Cancel an execution that never started.
    async fn abandon(&self, mut execution: Execution) {
        settle_stages(&mut execution, StageStatus::Cancelled, self.inner.clock.now());
        execution.status = ExecutionStatus::Cancelled;
        execution.error_summary = Some("Cancelled before start".into());
        self.finalize(execution).await;
    }

    fn dispatch(&self, execution_id: ExecutionId, pipeline_id: PipelineId) {
        let this = self.clone();
        self.inner.tracker.spawn(async move {
            this.drive(execution_id).await;
            let next = this.inner.admission.lock().await.release(pipeline_id);
            if let Some(next) = next {
                debug!(execution_id = %next, pipeline_id = %pipeline_id, "Admitting queued execution");
                this.inner
                    .logs
                    .info(next, None, "Admitted from queue".to_string());
                this.dispatch(next, pipeline_id);
            }
        });
    }

    async fn drive(&self, execution_id: ExecutionId) {
        let inner = &self.inner;
        let Some(cancel) = inner.active.get(&execution_id).map(|a| a.cancel.clone()) else {
            return;
        };
        let mut execution = match inner.repos.executions.get(execution_id).await {
            Ok(execution) => execution,
            Err(e) => {
                error!(execution_id = %execution_id, error = %e, "Failed to load execution");
                inner.active.remove(&execution_id);
                inner.logs.close(execution_id);
                return;
            }
        };

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            permit = inner.workers.clone().acquire_owned() => permit.ok(),
        };
        let Some(_permit) = permit else {
            self.abandon(execution).await;
            return;
        };

        let span = execution_span(
            execution.pipeline_id,
            &execution.pipeline_name,
            execution.pipeline_version,
            execution.id,
        );
        self.run(&mut execution, &cancel).instrument(span).await;
        self.finalize(execution).await;
    }

    async fn prepare(
        &self,
        execution: &Execution,
    ) -> Result<(Arc<ExecutionPlan>, Arc<ExecutionSnapshot>)> {
        let repos = &self.inner.repos;
        let pipeline = repos
            .pipelines
            .get_version(execution.pipeline_id, execution.pipeline_version)
            .await?;
        let plan = self.inner.plan(&pipeline).await?;
        let snapshot = ExecutionSnapshot::load(repos, pipeline).await?;
        Ok((plan, Arc::new(snapshot)))
    }

    /// Drive an execution to a terminal status, leaving persistence of that
    /// status to `finalize`.
    async fn run(&self, execution: &mut Execution, cancel: &CancellationToken) {
        let inner = &self.inner;
        let (plan, snapshot) = match self.prepare(execution).await {
            Ok(prepared) => prepared,
            Err(e) => {
                error!(execution_id = %execution.id, error = %e, "Failed to prepare execution");
                settle_stages(execution, StageStatus::Skipped, inner.clock.now());
                execution.status = ExecutionStatus::Failed;
                execution.error_summary = Some(e.to_string());
                return;
            }
        };

        let definition = &snapshot.pipeline.definition;
        let limit = definition
            .timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or_else(|| inner.config.execution_timeout());
        let deadline = Instant::now() + limit;
        let retry_budget = definition
            .max_retries
            .unwrap_or(inner.config.execution_retries);
        let mode = definition.failure_mode.unwrap_or(inner.config.failure_mode);
        let backoff = inner.backoff();

        execution.status = ExecutionStatus::Running;
        execution.started_at = Some(inner.clock.now());
        self.persist(execution).await;

        let order: Vec<&str> = plan.order().map(StageId::as_str).collect();
        info!(execution_id = %execution.id, stages = plan.len(), ?mode, "Execution started");
        inner.logs.info(
            execution.id,
            None,
            format!("Running {} stages in order: {}", plan.len(), order.join(", ")),
        );

        loop {
            let result = self
                .run_pass(execution, &plan, &snapshot, mode, cancel, deadline)
                .await;
            let (summary, retryable) = match result {
                PassResult::Succeeded => {
                    execution.status = ExecutionStatus::Succeeded;
                    execution.error_summary = None;
                    return;
                }
                PassResult::Cancelled => {
                    mark_cancelled(execution, inner.clock.now());
                    return;
                }
                PassResult::TimedOut => {
                    mark_timed_out(execution, limit, inner.clock.now());
                    return;
                }
                PassResult::Failed { summary, retryable } => (summary, retryable),
            };

            execution.error_summary = Some(summary.clone());
            if !retryable || execution.retry_count >= retry_budget {
                execution.status = ExecutionStatus::Failed;
                return;
            }

            execution.retry_count += 1;
            execution.status = ExecutionStatus::Retrying;
            self.persist(execution).await;

            let delay = backoff.delay(execution.retry_count);
            warn!(
                execution_id = %execution.id,
                retry = execution.retry_count,
                budget = retry_budget,
                delay_ms = delay.as_millis() as u64,
                "Retrying execution"
            );
            inner.logs.warn(
                execution.id,
                None,
                format!(
                    "{summary}; retrying execution in {}ms (retry {} of {retry_budget})",
                    delay.as_millis(),
                    execution.retry_count
                ),
            );

            tokio::select! {
                _ = sleep(delay) => {}
                _ = cancel.cancelled() => {
                    mark_cancelled(execution, inner.clock.now());
                    return;
                }
                _ = sleep_until(deadline) => {
                    mark_timed_out(execution, limit, inner.clock.now());
                    return;
                }
            }

            for state in execution.stages.values_mut() {
                if state.status != StageStatus::Succeeded {
                    state.status = StageStatus::Pending;
                    state.error = None;
                    state.started_at = None;
                    state.completed_at = None;
                }
            }
            execution.status = ExecutionStatus::Running;
            self.persist(execution).await;
        }
    }

    /// One pass over the stages that have not succeeded yet.
    async fn run_pass(
        &self,
        execution: &mut Execution,
        plan: &ExecutionPlan,
        snapshot: &Arc<ExecutionSnapshot>,
        mode: FailureMode,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> PassResult {
        let inner = &self.inner;
        let pass = cancel.child_token();
        let mut tasks: JoinSet<StageReport> = JoinSet::new();
        let mut failures: Vec<(String, bool)> = Vec::new();
        let mut halted = false;
        let expiry = sleep_until(deadline);
        tokio::pin!(expiry);

        let interrupted = loop {
            if mode == FailureMode::BestEffort {
                for skipped in skip_blocked(execution, plan) {
                    inner.logs.warn(
                        execution.id,
                        Some(&skipped),
                        "Skipped: an upstream stage did not succeed",
                    );
                }
            }

            if !halted {
                for index in 0..plan.len() {
                    if tasks.len() >= inner.config.stage_workers || pass.is_cancelled() {
                        break;
                    }
                    if !is_ready(execution, plan, index) {
                        continue;
                    }
                    let stage = plan.stage(index);
                    let mut first_attempt = 1;
                    if let Some(state) = execution.stages.get_mut(&stage.id) {
                        state.status = StageStatus::Running;
                        state.started_at = Some(inner.clock.now());
                        state.completed_at = None;
                        first_attempt = state.attempts + 1;
                    }
                    self.persist(execution).await;
                    debug!(execution_id = %execution.id, stage = %stage.id, "Starting stage");
                    inner.logs.info(execution.id, Some(&stage.id), "Stage started");
                    let job =
                        self.stage_job(execution.id, stage, snapshot, index, first_attempt);
                    tasks.spawn(job.run(pass.clone()));
                }
            }

            if tasks.is_empty() {
                break pass.is_cancelled().then_some(PassResult::Cancelled);
            }

            tokio::select! {
                Some(joined) = tasks.join_next() => match joined {
                    Ok(report) => {
                        let cancelled = pass.is_cancelled();
                        if let Some(failure) = self.record(execution, plan, report).await
                            && !cancelled
                        {
                            failures.push(failure);
                            if mode == FailureMode::FailFast && !halted {
                                halted = true;
                                info!(execution_id = %execution.id, "Stage failed, starting no further stages");
                            }
                        }
                    }
                    Err(e) => error!(execution_id = %execution.id, error = %e, "Stage task failed to join"),
                },
                _ = pass.cancelled() => break Some(PassResult::Cancelled),
                _ = &mut expiry => break Some(PassResult::TimedOut),
            }
        };

        if let Some(result) = interrupted {
            pass.cancel();
            self.wind_down(execution, plan, &mut tasks).await;
            settle_stages(execution, StageStatus::Cancelled, inner.clock.now());
            self.persist(execution).await;
            return result;
        }

        for skipped in pending_stages(execution) {
            inner.logs.warn(
                execution.id,
                Some(&skipped),
                "Skipped: an upstream stage did not succeed",
            );
        }
        settle_stages(execution, StageStatus::Skipped, inner.clock.now());
        self.persist(execution).await;

        match failures.pop() {
            None => PassResult::Succeeded,
            Some((summary, last_retryable)) => PassResult::Failed {
                summary,
                retryable: last_retryable && failures.iter().all(|(_, r)| *r),
            },
        }
    }

    /// Collect stages after cancellation. Stages that miss the grace period
    /// are aborted.
    async fn wind_down(
        &self,
        execution: &mut Execution,
        plan: &ExecutionPlan,
        tasks: &mut JoinSet<StageReport>,
    ) {
        let grace = sleep(self.inner.config.cancel_grace());
        tokio::pin!(grace);

        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    Some(Ok(report)) => {
                        self.record(execution, plan, report).await;
                    }
                    Some(Err(_)) => {}
                    None => return,
                },
                _ = &mut grace => {
                    warn!(
                        execution_id = %execution.id,
                        stages = tasks.len(),
                        "Grace period elapsed, terminating stages"
                    );
                    tasks.abort_all();
                    while tasks.join_next().await.is_some() {}
                    return;
                }
            }
        }
    }

    /// Apply a stage report. Returns the failure summary and whether it is
    /// retryable, unless the stage succeeded.
    async fn record(
        &self,
        execution: &mut Execution,
        plan: &ExecutionPlan,
        report: StageReport,
    ) -> Option<(String, bool)> {
        let inner = &self.inner;
        let stage = plan.stage(report.index);
        let attempts = match report.attempts {
            1 => "1 attempt".to_string(),
            n => format!("{n} attempts"),
        };

        let (error, failure) = match &report.outcome {
            StageOutcome::Succeeded(_) => (None, None),
            StageOutcome::Failed { reason, retryable } => (
                Some(reason.clone()),
                Some((
                    format!("Stage '{}' failed after {attempts}: {reason}", stage.id),
                    *retryable,
                )),
            ),
            StageOutcome::TimedOut { seconds } => {
                let err = Error::StageTimeout {
                    stage: stage.id.to_string(),
                    seconds: *seconds,
                };
                (Some(err.to_string()), Some((err.to_string(), false)))
            }
            StageOutcome::Cancelled => (
                Some("cancelled".to_string()),
                Some((format!("Stage '{}' was cancelled", stage.id), false)),
            ),
        };

        if let Some(state) = execution.stages.get_mut(&stage.id) {
            state.status = report.outcome.status();
            state.attempts += report.attempts;
            state.completed_at = Some(inner.clock.now());
            state.error = error;
        }
        self.persist(execution).await;

        match &report.outcome {
            StageOutcome::Succeeded(stats) => {
                info!(
                    execution_id = %execution.id,
                    stage = %stage.id,
                    attempts = report.attempts,
                    records_written = stats.records_written,
                    "Stage succeeded"
                );
                inner.logs.info(execution.id, Some(&stage.id), "Stage succeeded");
            }
            outcome => {
                warn!(
                    execution_id = %execution.id,
                    stage = %stage.id,
                    attempts = report.attempts,
                    status = ?outcome.status(),
                    "Stage did not succeed"
                );
            }
        }

        failure
    }

    fn stage_job(
        &self,
        execution_id: ExecutionId,
        stage: &StageDefinition,
        snapshot: &Arc<ExecutionSnapshot>,
        index: usize,
        first_attempt: u32,
    ) -> StageJob {
        let default = self.inner.backoff();
        let (budget, backoff) = match &stage.retry {
            Some(policy) => (policy.max_retries, Backoff::for_retry(policy, default)),
            None => (self.inner.config.stage_retries, default),
        };
        StageJob {
            execution_id,
            stage: stage.clone(),
            snapshot: snapshot.clone(),
            index,
            first_attempt,
            budget,
            backoff,
            runner: self.inner.runner.clone(),
            logs: self.inner.logs.clone(),
        }
    }

    async fn persist(&self, execution: &Execution) {
        if let Err(e) = self.inner.repos.executions.update(execution).await {
            error!(execution_id = %execution.id, error = %e, "Failed to persist execution");
        }
    }

    /// Record the terminal status, then close the log and release the token.
    async fn finalize(&self, mut execution: Execution) {
        let inner = &self.inner;
        execution.completed_at = Some(inner.clock.now());
        self.persist(&execution).await;

        let summary = execution.error_summary.as_deref().unwrap_or("");
        match execution.status {
            ExecutionStatus::Succeeded => {
                info!(
                    execution_id = %execution.id,
                    duration_ms = execution.duration_ms(),
                    "Execution succeeded"
                );
                inner.logs.info(execution.id, None, "Execution succeeded");
            }
            ExecutionStatus::Failed => {
                warn!(execution_id = %execution.id, error = summary, "Execution failed");
                inner
                    .logs
                    .error(execution.id, None, format!("Execution failed: {summary}"));
            }
            ExecutionStatus::Cancelled => {
                info!(execution_id = %execution.id, "Execution cancelled");
                inner.logs.warn(execution.id, None, "Execution cancelled");
            }
            status => {
                error!(execution_id = %execution.id, ?status, "Finalized a non-terminal execution");
            }
        }

        inner.logs.close(execution.id);
        inner.active.remove(&execution.id);
    }
}

#[async_trait]
impl ExecutionSubmitter for Orchestrator {
    async fn submit(&self, request: ExecutionRequest) -> Result<ExecutionId> {
        Orchestrator::submit(self, request).await
    }
}

fn status_of(execution: &Execution, plan: &ExecutionPlan, index: usize) -> Option<StageStatus> {
    execution.stage_status(&plan.stage(index).id)
}

/// Pending, with every upstream succeeded.
fn is_ready(execution: &Execution, plan: &ExecutionPlan, index: usize) -> bool {
    status_of(execution, plan, index) == Some(StageStatus::Pending)
        && plan
            .upstream(index)
            .iter()
            .all(|&up| status_of(execution, plan, up) == Some(StageStatus::Succeeded))
}

/// Mark pending stages with a terminally unsuccessful upstream `Skipped`.
/// Plan order is topological, so one sweep covers transitive descendants.
fn skip_blocked(execution: &mut Execution, plan: &ExecutionPlan) -> Vec<StageId> {
    let mut skipped = Vec::new();
    for index in 0..plan.len() {
        let blocked = status_of(execution, plan, index) == Some(StageStatus::Pending)
            && plan.upstream(index).iter().any(|&up| {
                status_of(execution, plan, up)
                    .is_some_and(|s| s.is_terminal() && s != StageStatus::Succeeded)
            });
        if blocked {
            let id = plan.stage(index).id.clone();
            if let Some(state) = execution.stages.get_mut(&id) {
                state.status = StageStatus::Skipped;
            }
            skipped.push(id);
        }
    }
    skipped
}

fn pending_stages(execution: &Execution) -> Vec<StageId> {
    execution
        .stages
        .iter()
        .filter(|(_, s)| s.status == StageStatus::Pending)
        .map(|(id, _)| id.clone())
        .collect()
}

/// Move every non-terminal stage to `status`.
fn settle_stages(execution: &mut Execution, status: StageStatus, at: DateTime<Utc>) {
    for state in execution.stages.values_mut() {
        if state.status.is_terminal() {
            continue;
        }
        if state.status == StageStatus::Running {
            state.completed_at = Some(at);
        }
        state.status = status;
    }
}

fn mark_cancelled(execution: &mut Execution, at: DateTime<Utc>) {
    settle_stages(execution, StageStatus::Cancelled, at);
    execution.status = ExecutionStatus::Cancelled;
    execution.error_summary = Some("Cancelled".into());
}

fn mark_timed_out(execution: &mut Execution, limit: Duration, at: DateTime<Utc>) {
    settle_stages(execution, StageStatus::Cancelled, at);
    execution.status = ExecutionStatus::Failed;
    execution.error_summary = Some(
        Error::ExecutionTimeout {
            seconds: limit.as_secs(),
        }
        .to_string(),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sluice_core::clock::SystemClock;
    use sluice_core::dataset::DatasetDefinition;
    use sluice_core::datasource::DataSourceDefinition;
    use sluice_core::pipeline::{PipelineDefinition, StageInput, TransformSpec};
    use sluice_runner::StageStats;
    use sluice_store::memory_repositories;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    /// Scripted runner: each stage fails its first N attempts with the
    /// given outcome, then succeeds.
    #[derive(Default)]
    struct ScriptedRunner {
        script: HashMap<String, (u32, StageOutcome)>,
        started: StdMutex<Vec<(String, u32)>>,
    }

    impl ScriptedRunner {
        fn failing(mut self, stage: &str, times: u32, outcome: StageOutcome) -> Self {
            self.script.insert(stage.to_string(), (times, outcome));
            self
        }

        fn started(&self) -> Vec<(String, u32)> {
            self.started.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl StepRunner for ScriptedRunner {
        async fn run(&self, ctx: &StageContext, _cancel: CancellationToken) -> StageOutcome {
            let id = ctx.stage.id.to_string();
            self.started.lock().unwrap().push((id.clone(), ctx.attempt));
            match self.script.get(&id) {
                Some((times, outcome)) if ctx.attempt <= *times => outcome.clone(),
                _ => StageOutcome::Succeeded(StageStats::default()),
            }
        }
    }

    fn connection_failure() -> StageOutcome {
        StageOutcome::failed(&Error::Connection("warehouse".into()))
    }

    fn schema_failure() -> StageOutcome {
        StageOutcome::failed(&Error::Schema("missing id".into()))
    }

    struct Fixture {
        repos: Repositories,
        orchestrator: Orchestrator,
        runner: Arc<ScriptedRunner>,
        pipeline: Pipeline,
    }

    /// `edges` are (stage, upstream stages).
    async fn fixture(
        runner: ScriptedRunner,
        edges: &[(&str, &[&str])],
        config: OrchestratorConfig,
    ) -> Fixture {
        let repos = memory_repositories();
        let source = repos
            .data_sources
            .create(&DataSourceDefinition {
                name: "warehouse".into(),
                connector: "memory".into(),
                parameters: Default::default(),
            })
            .await
            .unwrap();
        let raw = repos
            .datasets
            .create(&DatasetDefinition {
                name: "raw".into(),
                source_id: source.id,
                category: Default::default(),
                schema: Default::default(),
                location: None,
            })
            .await
            .unwrap();

        let mut stages = Vec::new();
        for (id, upstream) in edges {
            let output = repos
                .datasets
                .create(&DatasetDefinition {
                    name: format!("{id}_out"),
                    source_id: source.id,
                    category: Default::default(),
                    schema: Default::default(),
                    location: None,
                })
                .await
                .unwrap();
            let mut inputs = vec![StageInput::Dataset(raw.id)];
            inputs.extend(upstream.iter().map(|u| StageInput::Stage(StageId::new(*u))));
            stages.push(StageDefinition {
                id: StageId::new(*id),
                inputs,
                depends_on: vec![],
                transform: TransformSpec::Passthrough,
                output: output.id,
                timeout_seconds: None,
                retry: None,
                append_safe: false,
            });
        }
        let pipeline = repos
            .pipelines
            .create(&PipelineDefinition {
                name: "orders".into(),
                description: None,
                stages,
                concurrency: 1,
                max_retries: None,
                timeout_seconds: None,
                failure_mode: None,
            })
            .await
            .unwrap();

        let runner = Arc::new(runner);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let orchestrator = Orchestrator::new(
            repos.clone(),
            runner.clone(),
            Arc::new(ExecutionLogSink::new(clock.clone())),
            clock,
            config,
        );
        Fixture {
            repos,
            orchestrator,
            runner,
            pipeline,
        }
    }

    fn fast_config() -> OrchestratorConfig {
        OrchestratorConfig {
            backoff_base_ms: 10,
            backoff_ceiling_ms: 100,
            ..Default::default()
        }
    }

    async fn run_to_end(fx: &Fixture) -> Execution {
        let id = fx
            .orchestrator
            .submit(ExecutionRequest::manual(fx.pipeline.id, None))
            .await
            .unwrap();
        fx.orchestrator.shutdown(ShutdownPolicy::Drain).await;
        fx.repos.executions.get(id).await.unwrap()
    }

    fn statuses(execution: &Execution) -> Vec<(&str, StageStatus)> {
        execution
            .stages
            .iter()
            .map(|(id, s)| (id.as_str(), s.status))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_stages_start_in_topological_order() {
        let fx = fixture(
            ScriptedRunner::default(),
            &[("load", &["clean"]), ("clean", &["extract"]), ("extract", &[])],
            OrchestratorConfig {
                stage_workers: 1,
                ..fast_config()
            },
        )
        .await;

        let execution = run_to_end(&fx).await;
        assert_eq!(execution.status, ExecutionStatus::Succeeded);
        let started: Vec<_> = fx.runner.started().into_iter().map(|(s, _)| s).collect();
        assert_eq!(started, vec!["extract", "clean", "load"]);
        assert!(execution.started_at.is_some());
        assert!(execution.completed_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_fast_skips_unstarted_stages() {
        let fx = fixture(
            ScriptedRunner::default().failing("a", 1, schema_failure()),
            &[("a", &[]), ("b", &["a"]), ("c", &[])],
            OrchestratorConfig {
                stage_workers: 1,
                ..fast_config()
            },
        )
        .await;

        let execution = run_to_end(&fx).await;
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(
            statuses(&execution),
            vec![
                ("a", StageStatus::Failed),
                ("b", StageStatus::Skipped),
                ("c", StageStatus::Skipped),
            ]
        );
        let summary = execution.error_summary.unwrap();
        assert!(summary.starts_with("Stage 'a' failed after 1 attempt:"), "{summary}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_best_effort_continues_independent_branches() {
        let fx = fixture(
            ScriptedRunner::default().failing("a", 1, schema_failure()),
            &[("a", &[]), ("b", &["a"]), ("c", &[]), ("d", &["c"])],
            OrchestratorConfig {
                stage_workers: 1,
                failure_mode: FailureMode::BestEffort,
                ..fast_config()
            },
        )
        .await;

        let execution = run_to_end(&fx).await;
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(
            statuses(&execution),
            vec![
                ("a", StageStatus::Failed),
                ("b", StageStatus::Skipped),
                ("c", StageStatus::Succeeded),
                ("d", StageStatus::Succeeded),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stage_retries_transient_failures() {
        let fx = fixture(
            ScriptedRunner::default().failing("a", 2, connection_failure()),
            &[("a", &[])],
            fast_config(),
        )
        .await;

        let execution = run_to_end(&fx).await;
        assert_eq!(execution.status, ExecutionStatus::Succeeded);
        assert_eq!(execution.stages[&StageId::new("a")].attempts, 3);
        assert_eq!(
            fx.runner.started(),
            vec![("a".into(), 1), ("a".into(), 2), ("a".into(), 3)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_failure_is_not_retried() {
        let fx = fixture(
            ScriptedRunner::default().failing("a", 1, schema_failure()),
            &[("a", &[])],
            OrchestratorConfig {
                execution_retries: 2,
                ..fast_config()
            },
        )
        .await;

        let execution = run_to_end(&fx).await;
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.retry_count, 0);
        assert_eq!(fx.runner.started().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execution_retry_reruns_only_unsucceeded_stages() {
        // Exhausts one stage retry in the first pass, succeeds in the second.
        let fx = fixture(
            ScriptedRunner::default().failing("b", 2, connection_failure()),
            &[("a", &[]), ("b", &["a"])],
            OrchestratorConfig {
                stage_retries: 1,
                execution_retries: 1,
                ..fast_config()
            },
        )
        .await;

        let execution = run_to_end(&fx).await;
        assert_eq!(execution.status, ExecutionStatus::Succeeded);
        assert_eq!(execution.retry_count, 1);
        assert_eq!(execution.error_summary, None);
        assert_eq!(
            fx.runner.started(),
            vec![("a".into(), 1), ("b".into(), 1), ("b".into(), 2), ("b".into(), 3)]
        );
        assert_eq!(execution.stages[&StageId::new("a")].attempts, 1);
        assert_eq!(execution.stages[&StageId::new("b")].attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_dataset_fails_before_any_stage() {
        let fx = fixture(ScriptedRunner::default(), &[("a", &[])], fast_config()).await;
        let output = fx.pipeline.definition.stages[0].output;
        fx.repos.datasets.delete(output).await.unwrap();

        let result = fx
            .orchestrator
            .submit(ExecutionRequest::manual(fx.pipeline.id, None))
            .await;
        assert!(matches!(result, Err(Error::DanglingReference { .. })));
        assert!(fx.runner.started().is_empty());
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_rejected() {
        let fx = fixture(ScriptedRunner::default(), &[("a", &[])], fast_config()).await;
        fx.orchestrator.shutdown(ShutdownPolicy::Drain).await;
        let result = fx
            .orchestrator
            .submit(ExecutionRequest::manual(fx.pipeline.id, None))
            .await;
        assert!(matches!(result, Err(Error::Internal(_))));
    }
}
