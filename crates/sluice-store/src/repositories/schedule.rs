//! In-memory implementation of ScheduleRepository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sluice_core::clock::{Clock, SystemClock};
use sluice_core::ids::ScheduleId;
use sluice_core::ports::ScheduleRepository;
use sluice_core::schedule::{Schedule, ScheduleDefinition};
use sluice_core::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

pub struct MemScheduleRepository {
    rows: RwLock<HashMap<ScheduleId, Schedule>>,
    clock: Arc<dyn Clock>,
}

impl MemScheduleRepository {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            rows: RwLock::default(),
            clock,
        }
    }
}

impl Default for MemScheduleRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ScheduleRepository for MemScheduleRepository {
    async fn create(&self, definition: &ScheduleDefinition) -> Result<Schedule> {
        let now = self.clock.now();
        let schedule = Schedule {
            id: ScheduleId::new(),
            pipeline_id: definition.pipeline_id,
            expression: definition.expression.clone(),
            enabled: definition.enabled,
            catch_up: definition.catch_up,
            next_fire_at: None,
            last_fired_at: None,
            created_at: now,
            updated_at: now,
        };
        self.rows.write().await.insert(schedule.id, schedule.clone());
        Ok(schedule)
    }

    async fn get(&self, id: ScheduleId) -> Result<Schedule> {
        self.rows
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("Schedule", id))
    }

    async fn list(&self) -> Result<Vec<Schedule>> {
        let mut schedules: Vec<_> = self.rows.read().await.values().cloned().collect();
        schedules.sort_by_key(|s| s.id);
        Ok(schedules)
    }

    async fn update(&self, schedule: &Schedule) -> Result<()> {
        let mut rows = self.rows.write().await;
        let row = rows
            .get_mut(&schedule.id)
            .ok_or_else(|| Error::not_found("Schedule", schedule.id))?;
        *row = Schedule {
            updated_at: self.clock.now(),
            ..schedule.clone()
        };
        Ok(())
    }

    async fn record_fire(
        &self,
        id: ScheduleId,
        fired_at: Option<DateTime<Utc>>,
        next_fire_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let mut rows = self.rows.write().await;
        let Some(row) = rows.get_mut(&id).filter(|s| s.enabled) else {
            return Ok(false);
        };
        if fired_at.is_some() {
            row.last_fired_at = fired_at;
        }
        row.next_fire_at = next_fire_at;
        row.updated_at = self.clock.now();
        Ok(true)
    }

    async fn delete(&self, id: ScheduleId) -> Result<()> {
        self.rows
            .write()
            .await
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| Error::not_found("Schedule", id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use sluice_core::clock::ManualClock;
    use sluice_core::ids::PipelineId;
    use sluice_core::schedule::CatchUpPolicy;

    fn definition() -> ScheduleDefinition {
        ScheduleDefinition {
            pipeline_id: PipelineId::new(),
            expression: "*/5 * * * *".into(),
            enabled: true,
            catch_up: CatchUpPolicy::Skip,
        }
    }

    #[tokio::test]
    async fn test_timestamps_follow_injected_clock() {
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let repo = MemScheduleRepository::with_clock(clock.clone());

        let schedule = repo.create(&definition()).await.unwrap();
        assert_eq!(schedule.created_at, start);
        assert_eq!(schedule.updated_at, start);

        clock.advance(Duration::minutes(7));
        repo.update(&schedule).await.unwrap();
        let stored = repo.get(schedule.id).await.unwrap();
        assert_eq!(stored.created_at, start);
        assert_eq!(stored.updated_at, start + Duration::minutes(7));

        clock.advance(Duration::minutes(1));
        assert!(repo.record_fire(schedule.id, None, None).await.unwrap());
        let stored = repo.get(schedule.id).await.unwrap();
        assert_eq!(stored.updated_at, start + Duration::minutes(8));
    }

    #[tokio::test]
    async fn test_record_fire_only_touches_fire_fields() {
        let repo = MemScheduleRepository::new();
        let schedule = repo.create(&definition()).await.unwrap();
        let fired = Utc::now();
        let next = fired + Duration::minutes(5);

        assert!(repo.record_fire(schedule.id, Some(fired), Some(next)).await.unwrap());
        let stored = repo.get(schedule.id).await.unwrap();
        assert_eq!(stored.last_fired_at, Some(fired));
        assert_eq!(stored.next_fire_at, Some(next));
        assert_eq!(stored.expression, schedule.expression);
        assert!(stored.enabled);

        // A bookkeeping-only advance keeps the previous fire.
        assert!(repo.record_fire(schedule.id, None, None).await.unwrap());
        let stored = repo.get(schedule.id).await.unwrap();
        assert_eq!(stored.last_fired_at, Some(fired));
        assert_eq!(stored.next_fire_at, None);
    }

    #[tokio::test]
    async fn test_record_fire_skips_disabled_and_missing() {
        let repo = MemScheduleRepository::new();
        let mut schedule = repo.create(&definition()).await.unwrap();
        schedule.enabled = false;
        repo.update(&schedule).await.unwrap();

        let next = Some(Utc::now());
        assert!(!repo.record_fire(schedule.id, next, next).await.unwrap());
        let stored = repo.get(schedule.id).await.unwrap();
        assert!(!stored.enabled);
        assert_eq!(stored.next_fire_at, None);
        assert_eq!(stored.last_fired_at, None);

        assert!(!repo.record_fire(ScheduleId::new(), next, next).await.unwrap());
    }
}
