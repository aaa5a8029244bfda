//! Per-pipeline admission slots and bounded wait queues.

use sluice_core::ids::{ExecutionId, PipelineId};
use sluice_core::{Error, Result};
use std::collections::{HashMap, VecDeque};

/// Outcome of an admission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A slot was taken; the execution may start.
    Start,
    /// Waiting behind others; `position` is 0-based.
    Queued { position: usize },
}

#[derive(Debug, Default)]
struct Slot {
    running: usize,
    waiting: VecDeque<ExecutionId>,
}

/// Tracks running executions and FIFO waiters per pipeline.
///
/// Not synchronized itself; the orchestrator keeps it behind one lock so
/// that admission and completion never race on a slot count.
#[derive(Debug)]
pub struct AdmissionQueue {
    slots: HashMap<PipelineId, Slot>,
    capacity: usize,
}

impl AdmissionQueue {
    /// `capacity` bounds the waiters of each pipeline.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: HashMap::new(),
            capacity,
        }
    }

    /// Take a slot when fewer than `limit` executions run and nobody is
    /// waiting; otherwise queue, or fail with `Backpressure` when full.
    pub fn admit(
        &mut self,
        pipeline: PipelineId,
        limit: usize,
        execution: ExecutionId,
    ) -> Result<Admission> {
        let capacity = self.capacity;
        let slot = self.slots.entry(pipeline).or_default();

        if slot.running < limit.max(1) && slot.waiting.is_empty() {
            slot.running += 1;
            return Ok(Admission::Start);
        }
        if slot.waiting.len() >= capacity {
            return Err(Error::Backpressure {
                pipeline: pipeline.to_string(),
                capacity,
            });
        }
        slot.waiting.push_back(execution);
        Ok(Admission::Queued {
            position: slot.waiting.len() - 1,
        })
    }

    /// Give back a slot. Returns the next waiter, which takes the slot.
    pub fn release(&mut self, pipeline: PipelineId) -> Option<ExecutionId> {
        let slot = self.slots.get_mut(&pipeline)?;
        slot.running = slot.running.saturating_sub(1);
        let next = slot.waiting.pop_front();
        if next.is_some() {
            slot.running += 1;
        }
        if slot.running == 0 && slot.waiting.is_empty() {
            self.slots.remove(&pipeline);
        }
        next
    }

    /// Drop a waiter. Returns whether it was waiting.
    pub fn withdraw(&mut self, pipeline: PipelineId, execution: ExecutionId) -> bool {
        let Some(slot) = self.slots.get_mut(&pipeline) else {
            return false;
        };
        let before = slot.waiting.len();
        slot.waiting.retain(|id| *id != execution);
        before != slot.waiting.len()
    }

    /// Remove and return every waiter of every pipeline.
    pub fn drain_waiting(&mut self) -> Vec<(PipelineId, ExecutionId)> {
        let mut drained = Vec::new();
        for (pipeline, slot) in &mut self.slots {
            drained.extend(slot.waiting.drain(..).map(|id| (*pipeline, id)));
        }
        self.slots.retain(|_, slot| slot.running > 0);
        drained
    }

    pub fn running(&self, pipeline: PipelineId) -> usize {
        self.slots.get(&pipeline).map_or(0, |s| s.running)
    }

    pub fn waiting(&self, pipeline: PipelineId) -> usize {
        self.slots.get(&pipeline).map_or(0, |s| s.waiting.len())
    }
}
