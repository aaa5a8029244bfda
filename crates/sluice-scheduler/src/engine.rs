//! The engine facade.
//!
//! Wires the trigger engine, orchestrator, step runner and log sink over one
//! set of repositories and exposes the operations collaborators call.

use crate::config::EngineConfig;
use crate::dag::DagResolver;
use crate::orchestrator::{Orchestrator, ShutdownPolicy};
use crate::triggers::TriggerEngine;
use sluice_core::clock::{Clock, SystemClock};
use sluice_core::execution::{Execution, ExecutionFilter, ExecutionRequest};
use sluice_core::ids::{DatasetId, ExecutionId, PipelineId, ScheduleId};
use sluice_core::pipeline::{Pipeline, PipelineDefinition};
use sluice_core::ports::{DataAccess, Repositories};
use sluice_core::schedule::{Schedule, ScheduleDefinition};
use sluice_core::{Error, Result};
use sluice_logs::{ExecutionLogSink, LogStream, spawn_retention_sweeper};
use sluice_runner::{DatasetStepRunner, RunnerConfig, StepRunner, TransformRegistry};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct EngineBuilder {
    repos: Repositories,
    data: Arc<dyn DataAccess>,
    config: EngineConfig,
    clock: Option<Arc<dyn Clock>>,
    transforms: TransformRegistry,
    runner: Option<Arc<dyn StepRunner>>,
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Registry consulted for `custom` transforms.
    pub fn transforms(mut self, transforms: TransformRegistry) -> Self {
        self.transforms = transforms;
        self
    }

    /// Replace the dataset step runner.
    pub fn runner(mut self, runner: Arc<dyn StepRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    pub fn build(self) -> Result<Engine> {
        self.config.validate()?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let logs = Arc::new(ExecutionLogSink::new(clock.clone()));
        let transforms = Arc::new(self.transforms);

        let runner = match self.runner {
            Some(runner) => runner,
            None => Arc::new(DatasetStepRunner::new(
                self.data,
                self.repos.data_sources.clone(),
                transforms.clone(),
                logs.clone(),
                clock.clone(),
                RunnerConfig {
                    stage_timeout: self.config.orchestrator.stage_timeout(),
                },
            )),
        };

        let orchestrator = Orchestrator::new(
            self.repos.clone(),
            runner,
            logs.clone(),
            clock.clone(),
            self.config.orchestrator.clone(),
        );
        let triggers = Arc::new(TriggerEngine::new(
            self.repos.schedules.clone(),
            Arc::new(orchestrator.clone()),
            clock.clone(),
            self.config.triggers.clone(),
        ));

        Ok(Engine {
            repos: self.repos,
            orchestrator,
            triggers,
            logs,
            transforms,
            config: self.config,
            shutdown: CancellationToken::new(),
            background: Mutex::new(Vec::new()),
        })
    }
}

/// Pipeline scheduling and execution engine.
pub struct Engine {
    repos: Repositories,
    orchestrator: Orchestrator,
    triggers: Arc<TriggerEngine>,
    logs: Arc<ExecutionLogSink>,
    transforms: Arc<TransformRegistry>,
    config: EngineConfig,
    shutdown: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    pub fn builder(repos: Repositories, data: Arc<dyn DataAccess>) -> EngineBuilder {
        EngineBuilder {
            repos,
            data,
            config: EngineConfig::default(),
            clock: None,
            transforms: TransformRegistry::new(),
            runner: None,
        }
    }

    pub fn repositories(&self) -> &Repositories {
        &self.repos
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn logs(&self) -> &Arc<ExecutionLogSink> {
        &self.logs
    }

    pub fn triggers(&self) -> &Arc<TriggerEngine> {
        &self.triggers
    }

    /// Reconcile missed fires, then start the trigger loop and the log
    /// retention sweeper.
    pub async fn start(&self) -> Result<()> {
        let caught_up = self.triggers.reconcile().await?;
        info!(caught_up, "Starting engine");

        let trigger_loop = self.triggers.clone().spawn(self.shutdown.child_token());
        let sweeper = spawn_retention_sweeper(
            self.logs.clone(),
            self.config.logs.retention(),
            self.config.logs.sweep_interval(),
            self.shutdown.child_token(),
        );
        self.background.lock().await.extend([trigger_loop, sweeper]);
        Ok(())
    }

    /// Stop the trigger loop and sweeper, then wind down executions.
    pub async fn shutdown(&self, policy: ShutdownPolicy) {
        info!(?policy, "Shutting down engine");
        self.shutdown.cancel();
        self.orchestrator.shutdown(policy).await;

        let handles: Vec<_> = self.background.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
    }

    pub async fn submit_execution(
        &self,
        pipeline_id: PipelineId,
        version: Option<u32>,
    ) -> Result<ExecutionId> {
        self.orchestrator
            .submit(ExecutionRequest::manual(pipeline_id, version))
            .await
    }

    pub async fn cancel_execution(&self, execution_id: ExecutionId) -> Result<()> {
        self.orchestrator.cancel(execution_id).await
    }

    pub async fn get_execution(&self, execution_id: ExecutionId) -> Result<Execution> {
        self.repos.executions.get(execution_id).await
    }

    pub async fn list_executions(&self, filter: &ExecutionFilter) -> Result<Vec<Execution>> {
        self.repos.executions.list(filter).await
    }

    /// Stream an execution's log. Finite for terminal executions; otherwise
    /// live until the execution reaches a terminal status.
    pub async fn stream_logs(&self, execution_id: ExecutionId) -> Result<LogStream> {
        let execution = self.repos.executions.get(execution_id).await?;
        if execution.is_terminal() {
            self.logs.close(execution_id);
        }
        Ok(self.logs.stream(execution_id))
    }

    pub async fn enable_schedule(&self, id: ScheduleId) -> Result<Schedule> {
        self.triggers.enable(id).await
    }

    pub async fn disable_schedule(&self, id: ScheduleId) -> Result<Schedule> {
        self.triggers.disable(id).await
    }

    pub async fn register_schedule(&self, definition: &ScheduleDefinition) -> Result<Schedule> {
        self.repos.pipelines.get(definition.pipeline_id).await?;
        self.triggers.register(definition).await
    }

    pub async fn remove_schedule(&self, id: ScheduleId) -> Result<()> {
        self.repos.schedules.delete(id).await?;
        info!(schedule_id = %id, "Removed schedule");
        Ok(())
    }

    /// Check a definition without storing it: stage graph, dataset
    /// references and transforms.
    pub async fn validate_pipeline(&self, definition: &PipelineDefinition) -> Result<()> {
        if definition.name.trim().is_empty() {
            return Err(Error::Validation("pipeline name must not be empty".into()));
        }
        if definition.concurrency == 0 {
            return Err(Error::Validation(format!(
                "pipeline '{}' has concurrency 0",
                definition.name
            )));
        }

        let known: HashSet<DatasetId> = self
            .repos
            .datasets
            .list()
            .await?
            .into_iter()
            .map(|d| d.id)
            .collect();
        DagResolver::plan(definition, &known)?;

        for stage in &definition.stages {
            self.transforms.check(&stage.transform).map_err(|e| {
                Error::Validation(format!("stage '{}': {e}", stage.id))
            })?;
        }
        Ok(())
    }

    pub async fn create_pipeline(&self, definition: &PipelineDefinition) -> Result<Pipeline> {
        self.validate_pipeline(definition).await?;
        let pipeline = self.repos.pipelines.create(definition).await?;
        info!(pipeline_id = %pipeline.id, name = %pipeline.name, "Created pipeline");
        Ok(pipeline)
    }

    /// Store a new version. Running executions keep the version they were
    /// bound to.
    pub async fn update_pipeline(
        &self,
        id: PipelineId,
        definition: &PipelineDefinition,
    ) -> Result<Pipeline> {
        self.validate_pipeline(definition).await?;
        let pipeline = self.repos.pipelines.update(id, definition).await?;
        info!(pipeline_id = %id, version = pipeline.version, "Updated pipeline");
        Ok(pipeline)
    }
}
