//! Engine behavior against the in-memory store and data access.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::StreamExt;
use pretty_assertions::assert_eq;
use serde_json::json;
use sluice_core::clock::{Clock, ManualClock, SystemClock};
use sluice_core::dataset::{Dataset, DatasetDefinition};
use sluice_core::datasource::{DataSource, DataSourceDefinition, HealthStatus};
use sluice_core::execution::{
    Execution, ExecutionFilter, ExecutionStatus, StageStatus, TriggerKind,
};
use sluice_core::ids::{ExecutionId, StageId};
use sluice_core::pipeline::{
    Pipeline, PipelineDefinition, StageDefinition, StageInput, TransformSpec,
};
use sluice_core::record::RecordBatch;
use sluice_core::schedule::{CatchUpPolicy, ScheduleDefinition};
use sluice_core::Error;
use sluice_runner::{StageContext, StageOutcome, StepRunner};
use sluice_scheduler::{Engine, EngineConfig, ShutdownPolicy};
use sluice_store::{MemoryDataAccess, memory_repositories_with_clock};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

struct Setup {
    data: MemoryDataAccess,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    runner: Option<Arc<dyn StepRunner>>,
    timeout_seconds: Option<u64>,
}

impl Default for Setup {
    fn default() -> Self {
        Self {
            data: MemoryDataAccess::new(),
            config: EngineConfig::default(),
            clock: Arc::new(SystemClock),
            runner: None,
            timeout_seconds: None,
        }
    }
}

struct Harness {
    engine: Engine,
    data: Arc<MemoryDataAccess>,
    source: DataSource,
    clean: Dataset,
    summary: Dataset,
    pipeline: Pipeline,
}

impl Setup {
    /// Two stages: `extract` keeps paid orders from `raw_orders`, `load`
    /// copies them into `order_summary`.
    async fn build(self) -> Harness {
        let repos = memory_repositories_with_clock(self.clock.clone());
        let data = Arc::new(self.data);
        let mut builder = Engine::builder(repos.clone(), data.clone())
            .config(self.config)
            .clock(self.clock);
        if let Some(runner) = self.runner {
            builder = builder.runner(runner);
        }
        let engine = builder.build().unwrap();

        let source = repos
            .data_sources
            .create(&DataSourceDefinition {
                name: "warehouse".into(),
                connector: "memory".into(),
                parameters: Default::default(),
            })
            .await
            .unwrap();
        let dataset = |name: &str| DatasetDefinition {
            name: name.into(),
            source_id: source.id,
            category: Default::default(),
            schema: Default::default(),
            location: None,
        };
        let raw = repos.datasets.create(&dataset("raw_orders")).await.unwrap();
        let clean = repos.datasets.create(&dataset("clean_orders")).await.unwrap();
        let summary = repos.datasets.create(&dataset("order_summary")).await.unwrap();

        let records = RecordBatch::from_values((1..=4).map(|id| {
            json!({ "id": id, "status": if id % 2 == 0 { "paid" } else { "open" } })
        }));
        data.insert(raw.id, records.records);

        let pipeline = engine
            .create_pipeline(&PipelineDefinition {
                name: "orders".into(),
                description: None,
                stages: vec![
                    stage("extract", vec![StageInput::Dataset(raw.id)], clean.id, filter_paid()),
                    stage(
                        "load",
                        vec![StageInput::Stage(StageId::new("extract"))],
                        summary.id,
                        TransformSpec::Passthrough,
                    ),
                ],
                concurrency: 1,
                max_retries: None,
                timeout_seconds: self.timeout_seconds,
                failure_mode: None,
            })
            .await
            .unwrap();

        Harness {
            engine,
            data,
            source,
            clean,
            summary,
            pipeline,
        }
    }
}

fn stage(
    id: &str,
    inputs: Vec<StageInput>,
    output: sluice_core::ids::DatasetId,
    transform: TransformSpec,
) -> StageDefinition {
    StageDefinition {
        id: StageId::new(id),
        inputs,
        depends_on: vec![],
        transform,
        output,
        timeout_seconds: None,
        retry: None,
        append_safe: false,
    }
}

fn filter_paid() -> TransformSpec {
    TransformSpec::Filter {
        field: "status".into(),
        equals: json!("paid"),
    }
}

async fn wait_for(engine: &Engine, id: ExecutionId, done: impl Fn(&Execution) -> bool) -> Execution {
    for _ in 0..100_000 {
        let execution = engine.get_execution(id).await.unwrap();
        if done(&execution) {
            return execution;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("execution {id} never reached the expected state");
}

async fn wait_for_terminal(engine: &Engine, id: ExecutionId) -> Execution {
    wait_for(engine, id, Execution::is_terminal).await
}

/// Ignores cancellation and never finishes on its own.
#[derive(Default)]
struct StubbornRunner {
    started: Mutex<Vec<String>>,
}

#[async_trait]
impl StepRunner for StubbornRunner {
    async fn run(&self, ctx: &StageContext, _cancel: CancellationToken) -> StageOutcome {
        self.started.lock().unwrap().push(ctx.stage.id.to_string());
        tokio::time::sleep(Duration::from_secs(3600)).await;
        StageOutcome::Succeeded(Default::default())
    }
}

#[tokio::test(start_paused = true)]
async fn test_execution_runs_stages_and_writes_output() {
    let h = Setup::default().build().await;

    let id = h.engine.submit_execution(h.pipeline.id, None).await.unwrap();
    let execution = wait_for_terminal(&h.engine, id).await;

    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    assert_eq!(execution.pipeline_version, 1);
    assert_eq!(execution.trigger, TriggerKind::Manual);
    assert_eq!(h.data.records(h.clean.id).len(), 2);
    assert_eq!(h.data.records(h.summary.id).len(), 2);

    let extract = &execution.stages[&StageId::new("extract")];
    let load = &execution.stages[&StageId::new("load")];
    assert_eq!(extract.attempts, 1);
    assert!(extract.completed_at.unwrap() <= load.started_at.unwrap());

    let source = h
        .engine
        .repositories()
        .data_sources
        .get(h.source.id)
        .await
        .unwrap();
    assert_eq!(source.health, HealthStatus::Healthy);
}

#[tokio::test(start_paused = true)]
async fn test_pinned_version_and_missing_pipeline() {
    let h = Setup::default().build().await;

    assert!(matches!(
        h.engine.submit_execution(h.pipeline.id, Some(7)).await,
        Err(Error::NotFound { .. })
    ));
    assert!(matches!(
        h.engine
            .submit_execution(sluice_core::ids::PipelineId::new(), None)
            .await,
        Err(Error::NotFound { .. })
    ));

    let id = h.engine.submit_execution(h.pipeline.id, Some(1)).await.unwrap();
    assert_eq!(
        wait_for_terminal(&h.engine, id).await.status,
        ExecutionStatus::Succeeded
    );
}

#[tokio::test(start_paused = true)]
async fn test_default_concurrency_admits_one_execution_at_a_time() {
    let h = Setup {
        data: MemoryDataAccess::new().with_read_delay(Duration::from_secs(1)),
        ..Default::default()
    }
    .build()
    .await;

    for _ in 0..3 {
        h.engine.submit_execution(h.pipeline.id, None).await.unwrap();
    }

    let admitted = ExecutionFilter::pipeline(h.pipeline.id)
        .with_statuses([ExecutionStatus::Running, ExecutionStatus::Retrying]);
    loop {
        let running = h.engine.list_executions(&admitted).await.unwrap();
        assert!(running.len() <= 1, "{} executions admitted at once", running.len());

        let all = h
            .engine
            .list_executions(&ExecutionFilter::pipeline(h.pipeline.id))
            .await
            .unwrap();
        if all.iter().all(Execution::is_terminal) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let finished: Vec<_> = h
        .engine
        .list_executions(&ExecutionFilter::pipeline(h.pipeline.id))
        .await
        .unwrap();
    assert_eq!(finished.len(), 3);
    assert!(finished.iter().all(|e| e.status == ExecutionStatus::Succeeded));
    // Queued executions start in submission order.
    for pair in finished.windows(2) {
        assert!(pair[0].started_at.unwrap() <= pair[1].started_at.unwrap());
        assert!(pair[0].completed_at.unwrap() <= pair[1].started_at.unwrap());
    }
}

#[tokio::test(start_paused = true)]
async fn test_full_admission_queue_is_backpressure() {
    let h = Setup {
        data: MemoryDataAccess::new().with_read_delay(Duration::from_secs(60)),
        config: EngineConfig::default().with_queue_capacity(1),
        ..Default::default()
    }
    .build()
    .await;

    let running = h.engine.submit_execution(h.pipeline.id, None).await.unwrap();
    let queued = h.engine.submit_execution(h.pipeline.id, None).await.unwrap();
    let rejected = h.engine.submit_execution(h.pipeline.id, None).await;
    assert!(matches!(rejected, Err(Error::Backpressure { capacity: 1, .. })));

    let all = h
        .engine
        .list_executions(&ExecutionFilter::pipeline(h.pipeline.id))
        .await
        .unwrap();
    assert_eq!(all.len(), 2);

    h.engine.shutdown(ShutdownPolicy::Cancel).await;
    for id in [running, queued] {
        let execution = h.engine.get_execution(id).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Cancelled);
        assert!(
            execution
                .stages
                .values()
                .all(|s| s.status == StageStatus::Cancelled)
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_cancelling_queued_execution() {
    let h = Setup {
        data: MemoryDataAccess::new().with_read_delay(Duration::from_secs(5)),
        ..Default::default()
    }
    .build()
    .await;

    let first = h.engine.submit_execution(h.pipeline.id, None).await.unwrap();
    let second = h.engine.submit_execution(h.pipeline.id, None).await.unwrap();
    h.engine.cancel_execution(second).await.unwrap();

    let cancelled = h.engine.get_execution(second).await.unwrap();
    assert_eq!(cancelled.status, ExecutionStatus::Cancelled);
    assert!(cancelled.started_at.is_none());

    assert_eq!(
        wait_for_terminal(&h.engine, first).await.status,
        ExecutionStatus::Succeeded
    );
    // Cancelling again is a no-op; unknown executions are NotFound.
    h.engine.cancel_execution(second).await.unwrap();
    assert!(matches!(
        h.engine.cancel_execution(ExecutionId::new()).await,
        Err(Error::NotFound { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_forces_termination_within_grace_period() {
    let runner = Arc::new(StubbornRunner::default());
    let grace = Duration::from_secs(5);
    let h = Setup {
        runner: Some(runner.clone()),
        config: EngineConfig::default().with_cancel_grace(grace),
        ..Default::default()
    }
    .build()
    .await;

    let id = h.engine.submit_execution(h.pipeline.id, None).await.unwrap();
    wait_for(&h.engine, id, |e| {
        e.stage_status(&StageId::new("extract")) == Some(StageStatus::Running)
    })
    .await;

    let cancelled_at = Instant::now();
    h.engine.cancel_execution(id).await.unwrap();
    let execution = wait_for_terminal(&h.engine, id).await;

    assert!(cancelled_at.elapsed() <= grace + Duration::from_millis(50));
    assert_eq!(execution.status, ExecutionStatus::Cancelled);
    assert_eq!(
        execution.stage_status(&StageId::new("extract")),
        Some(StageStatus::Cancelled)
    );
    let load = &execution.stages[&StageId::new("load")];
    assert_eq!(load.status, StageStatus::Cancelled);
    assert!(load.started_at.is_none());
    assert_eq!(*runner.started.lock().unwrap(), vec!["extract".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_is_honored_at_next_checkpoint() {
    let h = Setup {
        data: MemoryDataAccess::new()
            .with_batch_size(1)
            .with_read_delay(Duration::from_secs(1)),
        ..Default::default()
    }
    .build()
    .await;

    let id = h.engine.submit_execution(h.pipeline.id, None).await.unwrap();
    wait_for(&h.engine, id, |e| {
        e.stage_status(&StageId::new("extract")) == Some(StageStatus::Running)
    })
    .await;
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let cancelled_at = Instant::now();
    h.engine.cancel_execution(id).await.unwrap();
    let execution = wait_for_terminal(&h.engine, id).await;

    assert!(cancelled_at.elapsed() < h.engine.config().orchestrator.cancel_grace());
    assert_eq!(execution.status, ExecutionStatus::Cancelled);
    // Replace semantics: the interrupted stage left nothing behind.
    assert!(h.data.records(h.clean.id).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_connection_failure_retries_with_increasing_backoff() {
    let h = Setup::default().build().await;
    h.data.set_unreachable(h.source.id, None);

    let id = h.engine.submit_execution(h.pipeline.id, None).await.unwrap();
    let execution = wait_for_terminal(&h.engine, id).await;

    assert_eq!(execution.status, ExecutionStatus::Failed);
    let summary = execution.error_summary.clone().unwrap();
    assert!(summary.contains("Stage 'extract'"), "{summary}");
    assert!(summary.contains("after 4 attempts"), "{summary}");
    assert!(summary.contains("warehouse"), "{summary}");

    let extract = &execution.stages[&StageId::new("extract")];
    assert_eq!(extract.status, StageStatus::Failed);
    assert_eq!(extract.attempts, 4);
    assert_eq!(
        execution.stage_status(&StageId::new("load")),
        Some(StageStatus::Skipped)
    );

    let attempts = h.data.connection_attempts(h.source.id);
    assert_eq!(attempts.len(), 4);
    let gaps: Vec<Duration> = attempts.windows(2).map(|w| w[1] - w[0]).collect();
    for pair in gaps.windows(2) {
        assert!(pair[0] < pair[1], "gaps not increasing: {gaps:?}");
    }
    assert!(gaps[0] >= Duration::from_secs(1));

    let source = h
        .engine
        .repositories()
        .data_sources
        .get(h.source.id)
        .await
        .unwrap();
    assert_eq!(source.health, HealthStatus::Unreachable);
}

#[tokio::test(start_paused = true)]
async fn test_transient_outage_recovers_within_stage_budget() {
    let h = Setup::default().build().await;
    h.data.set_unreachable(h.source.id, Some(2));

    let id = h.engine.submit_execution(h.pipeline.id, None).await.unwrap();
    let execution = wait_for_terminal(&h.engine, id).await;

    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    assert_eq!(execution.stages[&StageId::new("extract")].attempts, 3);
    assert_eq!(h.data.records(h.summary.id).len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_execution_timeout_fails_and_cancels_remaining_stages() {
    let h = Setup {
        data: MemoryDataAccess::new().with_read_delay(Duration::from_secs(10)),
        config: EngineConfig::default().with_cancel_grace(Duration::from_secs(1)),
        timeout_seconds: Some(2),
        ..Default::default()
    }
    .build()
    .await;

    let id = h.engine.submit_execution(h.pipeline.id, None).await.unwrap();
    let execution = wait_for_terminal(&h.engine, id).await;

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(
        execution.error_summary.as_deref(),
        Some("Execution timed out after 2s")
    );
    assert!(
        execution
            .stages
            .values()
            .all(|s| s.status == StageStatus::Cancelled)
    );
}

#[tokio::test(start_paused = true)]
async fn test_log_stream_continues_live_until_terminal() {
    let h = Setup {
        data: MemoryDataAccess::new()
            .with_batch_size(1)
            .with_read_delay(Duration::from_millis(500)),
        ..Default::default()
    }
    .build()
    .await;

    let id = h.engine.submit_execution(h.pipeline.id, None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(700)).await;
    let before = h.engine.logs().entries(id).len();
    assert!(before > 0);

    let streamed: Vec<_> = h.engine.stream_logs(id).await.unwrap().collect().await;
    let execution = h.engine.get_execution(id).await.unwrap();
    assert!(execution.is_terminal());

    assert!(streamed.len() > before);
    let sequences: Vec<u64> = streamed.iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, (0..streamed.len() as u64).collect::<Vec<_>>());
    assert_eq!(streamed, h.engine.logs().entries(id));
    for pair in streamed.windows(2) {
        assert!(pair[0].timestamp <= pair[1].timestamp);
    }

    // A terminal execution's stream is finite and replays the same entries.
    let replay: Vec<_> = h.engine.stream_logs(id).await.unwrap().collect().await;
    assert_eq!(replay, streamed);
    assert!(matches!(
        h.engine.stream_logs(ExecutionId::new()).await,
        Err(Error::NotFound { .. })
    ));
}

fn midnight() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_run_all_catch_up_emits_each_missed_fire_oldest_first() {
    let clock = Arc::new(ManualClock::new(midnight()));
    let h = Setup {
        clock: clock.clone(),
        ..Default::default()
    }
    .build()
    .await;

    let schedule = h
        .engine
        .register_schedule(&ScheduleDefinition {
            pipeline_id: h.pipeline.id,
            expression: "*/5 * * * *".into(),
            enabled: true,
            catch_up: CatchUpPolicy::RunAll,
        })
        .await
        .unwrap();

    // Down from 00:00 to 00:17: fires at :05, :10 and :15 were missed.
    clock.advance(chrono::Duration::minutes(17));
    h.engine.start().await.unwrap();

    let executions = h
        .engine
        .list_executions(&ExecutionFilter {
            schedule_id: Some(schedule.id),
            ..Default::default()
        })
        .await
        .unwrap();
    let fires: Vec<_> = executions.iter().map(|e| e.scheduled_for.unwrap()).collect();
    assert_eq!(
        fires,
        vec![
            midnight() + chrono::Duration::minutes(5),
            midnight() + chrono::Duration::minutes(10),
            midnight() + chrono::Duration::minutes(15),
        ]
    );
    assert!(executions.iter().all(|e| e.trigger == TriggerKind::CatchUp));

    let schedule = h
        .engine
        .repositories()
        .schedules
        .get(schedule.id)
        .await
        .unwrap();
    assert_eq!(
        schedule.next_fire_at,
        Some(midnight() + chrono::Duration::minutes(20))
    );

    h.engine.shutdown(ShutdownPolicy::Drain).await;
    for execution in executions {
        let execution = h.engine.get_execution(execution.id).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Succeeded);
    }
}

#[tokio::test(start_paused = true)]
async fn test_reenabled_schedule_fires_strictly_after_now() {
    let clock = Arc::new(ManualClock::new(midnight()));
    let h = Setup {
        clock: clock.clone(),
        ..Default::default()
    }
    .build()
    .await;

    let schedule = h
        .engine
        .register_schedule(&ScheduleDefinition {
            pipeline_id: h.pipeline.id,
            expression: "0 * * * *".into(),
            enabled: true,
            catch_up: CatchUpPolicy::RunAll,
        })
        .await
        .unwrap();
    let disabled = h.engine.disable_schedule(schedule.id).await.unwrap();
    assert_eq!(disabled.next_fire_at, None);

    // Re-enable exactly on a fire boundary.
    clock.set(midnight() + chrono::Duration::hours(3));
    let enabled = h.engine.enable_schedule(schedule.id).await.unwrap();
    assert_eq!(
        enabled.next_fire_at,
        Some(midnight() + chrono::Duration::hours(4))
    );
    assert!(enabled.next_fire_at.unwrap() > clock.now());

    assert_eq!(h.engine.triggers().tick().await.unwrap(), 0);
    assert!(
        h.engine
            .list_executions(&ExecutionFilter::default())
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test(start_paused = true)]
async fn test_schedule_for_unknown_pipeline_is_rejected() {
    let h = Setup::default().build().await;
    let result = h
        .engine
        .register_schedule(&ScheduleDefinition {
            pipeline_id: sluice_core::ids::PipelineId::new(),
            expression: "0 * * * *".into(),
            enabled: true,
            catch_up: CatchUpPolicy::Skip,
        })
        .await;
    assert!(matches!(result, Err(Error::NotFound { .. })));
}

#[tokio::test]
async fn test_invalid_definitions_are_rejected_before_persistence() {
    let h = Setup::default().build().await;
    let clean = h.clean.id;
    let summary = h.summary.id;

    let cyclic = PipelineDefinition {
        name: "cyclic".into(),
        description: None,
        stages: vec![
            stage(
                "a",
                vec![StageInput::Stage(StageId::new("b"))],
                clean,
                TransformSpec::Passthrough,
            ),
            stage(
                "b",
                vec![StageInput::Stage(StageId::new("a"))],
                summary,
                TransformSpec::Passthrough,
            ),
        ],
        concurrency: 1,
        max_retries: None,
        timeout_seconds: None,
        failure_mode: None,
    };
    match h.engine.validate_pipeline(&cyclic).await {
        Err(Error::Cycle(names)) => assert_eq!(names, vec!["a", "b", "a"]),
        other => panic!("expected a cycle, got {other:?}"),
    }

    let dangling = PipelineDefinition {
        name: "dangling".into(),
        stages: vec![stage(
            "a",
            vec![StageInput::Stage(StageId::new("missing"))],
            clean,
            TransformSpec::Passthrough,
        )],
        ..cyclic.clone()
    };
    assert!(matches!(
        h.engine.create_pipeline(&dangling).await,
        Err(Error::DanglingReference { .. })
    ));

    let unknown_transform = PipelineDefinition {
        name: "custom".into(),
        stages: vec![stage(
            "a",
            vec![],
            clean,
            TransformSpec::Custom {
                name: "geocode".into(),
                config: serde_json::Value::Null,
            },
        )],
        ..cyclic.clone()
    };
    assert!(matches!(
        h.engine.validate_pipeline(&unknown_transform).await,
        Err(Error::Validation(_))
    ));

    let pipelines = h.engine.repositories().pipelines.list().await.unwrap();
    assert_eq!(pipelines.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_running_execution_keeps_its_pipeline_version() {
    let h = Setup {
        data: MemoryDataAccess::new().with_read_delay(Duration::from_secs(1)),
        ..Default::default()
    }
    .build()
    .await;

    let id = h.engine.submit_execution(h.pipeline.id, None).await.unwrap();
    let mut definition = h.pipeline.definition.clone();
    definition.stages[0].transform = TransformSpec::Passthrough;
    let updated = h
        .engine
        .update_pipeline(h.pipeline.id, &definition)
        .await
        .unwrap();
    assert_eq!(updated.version, 2);

    let execution = wait_for_terminal(&h.engine, id).await;
    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    assert_eq!(execution.pipeline_version, 1);
    // Version 1 still filtered.
    assert_eq!(h.data.records(h.clean.id).len(), 2);
}
