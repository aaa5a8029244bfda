//! Schedule evaluation.
//!
//! One cooperative loop ticks at a fixed resolution and emits an execution
//! request for every enabled schedule that is due. Emission never waits for
//! the execution to run.

use crate::config::TriggerConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;
use sluice_core::clock::Clock;
use sluice_core::execution::{ExecutionRequest, TriggerKind};
use sluice_core::ids::{ExecutionId, ScheduleId};
use sluice_core::ports::ScheduleRepository;
use sluice_core::schedule::{CatchUpPolicy, Schedule, ScheduleDefinition};
use sluice_core::{Error, Result};
use sluice_trace::trigger_span;
use std::collections::{BTreeSet, VecDeque};
use std::str::FromStr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

/// A parsed cron trigger expression.
///
/// Accepts standard five-field expressions (`min hour dom month dow`, with
/// Sunday as 0 or 7) and six or seven field expressions that lead with
/// seconds and number weekdays 1-7 from Sunday.
#[derive(Debug, Clone)]
pub struct TriggerExpression {
    schedule: CronSchedule,
}

impl TriggerExpression {
    pub fn parse(expression: &str) -> Result<Self> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        let normalized = match fields.as_slice() {
            [minute, hour, dom, month, dow] => {
                let dow = normalize_day_of_week(dow).map_err(|reason| {
                    Error::Validation(format!(
                        "invalid trigger expression '{expression}': {reason}"
                    ))
                })?;
                format!("0 {minute} {hour} {dom} {month} {dow}")
            }
            [_, _, _, _, _, _] | [_, _, _, _, _, _, _] => fields.join(" "),
            _ => {
                return Err(Error::Validation(format!(
                    "trigger expression '{expression}' has {} fields, expected 5",
                    fields.len()
                )));
            }
        };
        let schedule = CronSchedule::from_str(&normalized).map_err(|e| {
            Error::Validation(format!("invalid trigger expression '{expression}': {e}"))
        })?;
        Ok(Self { schedule })
    }

    /// First fire strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    /// Fires in `(after, until]`, oldest first.
    pub fn fires_between(
        &self,
        after: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> impl Iterator<Item = DateTime<Utc>> + '_ {
        self.schedule.after(&after).take_while(move |t| *t <= until)
    }
}

/// Rewrite a five-field day-of-week (0-7, Sunday is 0 and 7) into the
/// 1-7 from Sunday numbering the cron parser expects.
fn normalize_day_of_week(field: &str) -> std::result::Result<String, String> {
    if field == "*" || field == "?" {
        return Ok(field.to_string());
    }

    let mut days = BTreeSet::new();
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .ok()
                    .filter(|s| *s > 0)
                    .ok_or_else(|| format!("invalid day-of-week step in '{item}'"))?;
                (range, Some(step))
            }
            None => (item, None),
        };
        let (low, high) = match range {
            "*" => (0, 6),
            _ => match range.split_once('-') {
                Some((low, high)) => (weekday(low)?, weekday(high)?),
                None if step.is_some() => (weekday(range)?, 6),
                None => {
                    let day = weekday(range)?;
                    (day, day)
                }
            },
        };
        if low > high {
            return Err(format!("day-of-week range '{range}' runs backwards"));
        }
        let step = step.unwrap_or(1) as usize;
        days.extend((low..=high).step_by(step).map(|day| day % 7));
    }

    let days: Vec<String> = days.iter().map(|day| (day + 1).to_string()).collect();
    Ok(days.join(","))
}

fn weekday(token: &str) -> std::result::Result<u32, String> {
    if let Ok(day) = token.parse::<u32>() {
        return if day <= 7 {
            Ok(day)
        } else {
            Err(format!("day-of-week {day} is out of range 0-7"))
        };
    }
    match token.to_ascii_uppercase().as_str() {
        "SUN" => Ok(0),
        "MON" => Ok(1),
        "TUE" => Ok(2),
        "WED" => Ok(3),
        "THU" => Ok(4),
        "FRI" => Ok(5),
        "SAT" => Ok(6),
        _ => Err(format!("unknown day-of-week '{token}'")),
    }
}

/// Where the trigger engine sends execution requests.
#[async_trait]
pub trait ExecutionSubmitter: Send + Sync {
    async fn submit(&self, request: ExecutionRequest) -> Result<ExecutionId>;
}

/// Evaluates schedules against the clock.
pub struct TriggerEngine {
    schedules: Arc<dyn ScheduleRepository>,
    submitter: Arc<dyn ExecutionSubmitter>,
    clock: Arc<dyn Clock>,
    config: TriggerConfig,
}

impl TriggerEngine {
    pub fn new(
        schedules: Arc<dyn ScheduleRepository>,
        submitter: Arc<dyn ExecutionSubmitter>,
        clock: Arc<dyn Clock>,
        config: TriggerConfig,
    ) -> Self {
        Self {
            schedules,
            submitter,
            clock,
            config,
        }
    }

    /// Validate and store a schedule, computing its first fire.
    pub async fn register(&self, definition: &ScheduleDefinition) -> Result<Schedule> {
        let expression = TriggerExpression::parse(&definition.expression)?;
        let mut schedule = self.schedules.create(definition).await?;
        if schedule.enabled {
            schedule.next_fire_at = expression.next_after(self.clock.now());
            self.schedules.update(&schedule).await?;
        }
        info!(
            schedule_id = %schedule.id,
            pipeline_id = %schedule.pipeline_id,
            expression = %schedule.expression,
            next_fire_at = ?schedule.next_fire_at,
            "Registered schedule"
        );
        Ok(schedule)
    }

    /// Enable a schedule. Its next fire is strictly after now, so fires
    /// missed while disabled are never replayed.
    pub async fn enable(&self, id: ScheduleId) -> Result<Schedule> {
        let mut schedule = self.schedules.get(id).await?;
        let expression = TriggerExpression::parse(&schedule.expression)?;
        schedule.enabled = true;
        schedule.next_fire_at = expression.next_after(self.clock.now());
        self.schedules.update(&schedule).await?;
        info!(schedule_id = %id, next_fire_at = ?schedule.next_fire_at, "Enabled schedule");
        Ok(schedule)
    }

    /// Disable a schedule and clear its cached next fire.
    pub async fn disable(&self, id: ScheduleId) -> Result<Schedule> {
        let mut schedule = self.schedules.get(id).await?;
        schedule.enabled = false;
        schedule.next_fire_at = None;
        self.schedules.update(&schedule).await?;
        info!(schedule_id = %id, "Disabled schedule");
        Ok(schedule)
    }

    /// Evaluate every schedule once. Returns the number of requests emitted.
    ///
    /// A schedule that fails to evaluate is logged and skipped; the rest of
    /// the tick still runs.
    pub async fn tick(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut emitted = 0;

        for schedule in self.schedules.list().await? {
            if !schedule.enabled {
                continue;
            }
            match self.tick_schedule(&schedule, now).await {
                Ok(n) => emitted += n,
                Err(e) => {
                    error!(schedule_id = %schedule.id, error = %e, "Skipping schedule");
                }
            }
        }

        Ok(emitted)
    }

    async fn tick_schedule(&self, schedule: &Schedule, now: DateTime<Utc>) -> Result<usize> {
        let expression = TriggerExpression::parse(&schedule.expression)?;

        let fired = match schedule.next_fire_at {
            Some(due) if due <= now => {
                self.emit(schedule, due, TriggerKind::Schedule).await;
                Some(due)
            }
            Some(_) => return Ok(0),
            None => None,
        };

        self.advance(schedule, fired, expression.next_after(now)).await?;
        Ok(usize::from(fired.is_some()))
    }

    /// Reconcile fires missed while the process was down, per catch-up
    /// policy. Runs once at startup, before the first tick.
    pub async fn reconcile(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut emitted = 0;

        for schedule in self.schedules.list().await? {
            if !schedule.enabled {
                continue;
            }
            match self.reconcile_schedule(&schedule, now).await {
                Ok(n) => emitted += n,
                Err(e) => {
                    error!(schedule_id = %schedule.id, error = %e, "Skipping schedule");
                }
            }
        }

        Ok(emitted)
    }

    async fn reconcile_schedule(&self, schedule: &Schedule, now: DateTime<Utc>) -> Result<usize> {
        let expression = TriggerExpression::parse(&schedule.expression)?;

        let mut fires = VecDeque::new();
        if let Some(first) = schedule.next_fire_at.filter(|due| *due <= now) {
            let keep = match schedule.catch_up {
                CatchUpPolicy::Skip => 0,
                CatchUpPolicy::RunOnce => 1,
                CatchUpPolicy::RunAll => self.config.catch_up_cap,
            };

            // Only the most recent `keep` fires are held, however long the outage.
            let mut missed = 0usize;
            for fire in std::iter::once(first).chain(expression.fires_between(first, now)) {
                missed += 1;
                if keep == 0 {
                    continue;
                }
                if fires.len() == keep {
                    fires.pop_front();
                }
                fires.push_back(fire);
            }

            info!(
                schedule_id = %schedule.id,
                policy = ?schedule.catch_up,
                missed,
                emitting = fires.len(),
                "Reconciling missed fires"
            );

            for fire in &fires {
                self.emit(schedule, *fire, TriggerKind::CatchUp).await;
            }
        }

        self.advance(schedule, fires.back().copied(), expression.next_after(now)).await?;
        Ok(fires.len())
    }

    /// Store fire bookkeeping without touching fields edited elsewhere.
    async fn advance(
        &self,
        schedule: &Schedule,
        fired_at: Option<DateTime<Utc>>,
        next_fire_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let recorded = self
            .schedules
            .record_fire(schedule.id, fired_at, next_fire_at)
            .await?;
        if !recorded {
            debug!(schedule_id = %schedule.id, "Schedule disabled or removed while evaluating");
        }
        Ok(())
    }

    async fn emit(&self, schedule: &Schedule, fire_at: DateTime<Utc>, trigger: TriggerKind) {
        let request =
            ExecutionRequest::scheduled(schedule.pipeline_id, schedule.id, fire_at, trigger);
        let span = trigger_span(schedule.id, schedule.pipeline_id);

        match self.submitter.submit(request).instrument(span).await {
            Ok(execution_id) => {
                debug!(
                    schedule_id = %schedule.id,
                    execution_id = %execution_id,
                    fire_at = %fire_at,
                    "Emitted execution request"
                );
            }
            Err(e @ Error::Backpressure { .. }) => {
                warn!(schedule_id = %schedule.id, fire_at = %fire_at, error = %e, "Fire rejected");
            }
            Err(e) => {
                error!(schedule_id = %schedule.id, fire_at = %fire_at, error = %e, "Failed to emit fire");
            }
        }
    }

    /// Run the tick loop until `shutdown` is cancelled.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.config.tick());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            info!(tick_secs = self.config.tick_secs, "Starting trigger loop");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.tick().await {
                            error!(error = %e, "Trigger tick failed");
                        }
                    }
                    _ = shutdown.cancelled() => {
                        info!("Trigger loop shutting down");
                        break;
                    }
                }
            }
        })
    }
}
