//! The execution log sink.

use async_stream::stream;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::Stream;
use sluice_core::clock::Clock;
use sluice_core::ids::{ExecutionId, StageId};
use sluice_core::log::{ExecutionLogEntry, LogLevel};
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, trace};

/// Entries of one execution in append order; ends when the log closes.
pub type LogStream = Pin<Box<dyn Stream<Item = ExecutionLogEntry> + Send>>;

#[derive(Default)]
struct LogState {
    entries: VecDeque<ExecutionLogEntry>,
    next_sequence: u64,
    last_timestamp: Option<DateTime<Utc>>,
    closed: bool,
}

impl LogState {
    /// Entries at or after `cursor`, and whether the log is closed.
    fn read_from(&self, cursor: u64) -> (Vec<ExecutionLogEntry>, bool) {
        let entries = self
            .entries
            .iter()
            .skip_while(|e| e.sequence < cursor)
            .cloned()
            .collect();
        (entries, self.closed)
    }
}

struct ExecutionLog {
    state: Mutex<LogState>,
    /// Carries the next sequence number; bumped on every append and on close.
    notify: watch::Sender<u64>,
}

impl ExecutionLog {
    fn new() -> Self {
        let (notify, _) = watch::channel(0);
        Self {
            state: Mutex::new(LogState::default()),
            notify,
        }
    }

    fn state(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Append-only log store keyed by execution.
pub struct ExecutionLogSink {
    logs: DashMap<ExecutionId, Arc<ExecutionLog>>,
    clock: Arc<dyn Clock>,
}

impl ExecutionLogSink {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            logs: DashMap::new(),
            clock,
        }
    }

    fn log(&self, execution_id: ExecutionId) -> Arc<ExecutionLog> {
        self.logs
            .entry(execution_id)
            .or_insert_with(|| Arc::new(ExecutionLog::new()))
            .clone()
    }

    /// Start a log for an execution. Opening an existing log is a no-op.
    pub fn open(&self, execution_id: ExecutionId) {
        self.log(execution_id);
    }

    /// Append an entry. Returns its sequence number, or `None` when the log
    /// is already closed.
    ///
    /// Timestamps never go backwards within one execution: an entry stamped
    /// earlier than its predecessor takes the predecessor's timestamp.
    pub fn append(
        &self,
        execution_id: ExecutionId,
        stage_id: Option<&StageId>,
        level: LogLevel,
        message: impl Into<String>,
    ) -> Option<u64> {
        let log = self.log(execution_id);
        let sequence = {
            let mut state = log.state();
            if state.closed {
                trace!(execution_id = %execution_id, "Dropping entry for closed log");
                return None;
            }
            let now = self.clock.now();
            let timestamp = state.last_timestamp.map_or(now, |last| last.max(now));
            let sequence = state.next_sequence;
            state.entries.push_back(ExecutionLogEntry {
                execution_id,
                stage_id: stage_id.cloned(),
                sequence,
                timestamp,
                level,
                message: message.into(),
            });
            state.next_sequence += 1;
            state.last_timestamp = Some(timestamp);
            sequence
        };
        log.notify.send_replace(sequence + 1);
        Some(sequence)
    }

    pub fn info(
        &self,
        execution_id: ExecutionId,
        stage_id: Option<&StageId>,
        message: impl Into<String>,
    ) {
        self.append(execution_id, stage_id, LogLevel::Info, message);
    }

    pub fn warn(
        &self,
        execution_id: ExecutionId,
        stage_id: Option<&StageId>,
        message: impl Into<String>,
    ) {
        self.append(execution_id, stage_id, LogLevel::Warn, message);
    }

    pub fn error(
        &self,
        execution_id: ExecutionId,
        stage_id: Option<&StageId>,
        message: impl Into<String>,
    ) {
        self.append(execution_id, stage_id, LogLevel::Error, message);
    }

    /// Close an execution's log. Attached readers finish after draining.
    pub fn close(&self, execution_id: ExecutionId) {
        let log = self.log(execution_id);
        let next = {
            let mut state = log.state();
            if state.closed {
                return;
            }
            state.closed = true;
            state.next_sequence
        };
        log.notify.send_replace(next);
        debug!(execution_id = %execution_id, entries = next, "Closed execution log");
    }

    pub fn is_closed(&self, execution_id: ExecutionId) -> bool {
        self.logs
            .get(&execution_id)
            .is_some_and(|log| log.state().closed)
    }

    /// Snapshot of the retained entries of an execution.
    pub fn entries(&self, execution_id: ExecutionId) -> Vec<ExecutionLogEntry> {
        self.logs
            .get(&execution_id)
            .map(|log| log.state().entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Stream an execution's log from the first retained entry.
    ///
    /// The stream yields every entry appended before the call, then live
    /// entries, and ends once the log is closed and drained. Unknown
    /// executions produce an empty stream.
    pub fn stream(&self, execution_id: ExecutionId) -> LogStream {
        let log = self.logs.get(&execution_id).map(|l| l.clone());

        Box::pin(stream! {
            let Some(log) = log else {
                return;
            };
            // Subscribe before the first read so no append slips between.
            let mut changes = log.notify.subscribe();
            let mut cursor = 0u64;
            loop {
                let (entries, closed) = log.state().read_from(cursor);
                for entry in entries {
                    cursor = entry.sequence + 1;
                    yield entry;
                }
                if closed {
                    break;
                }
                if changes.changed().await.is_err() {
                    break;
                }
            }
        })
    }

    /// Drop entries stamped before `cutoff`, and forget closed logs that
    /// have nothing left. Returns the number of entries removed.
    pub fn evict_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let mut removed = 0;
        self.logs.retain(|_, log| {
            let mut state = log.state();
            while state
                .entries
                .front()
                .is_some_and(|entry| entry.timestamp < cutoff)
            {
                state.entries.pop_front();
                removed += 1;
            }
            !(state.closed && state.entries.is_empty())
        });
        if removed > 0 {
            debug!(removed, cutoff = %cutoff, "Evicted expired log entries");
        }
        removed
    }

    /// Evict everything older than `retention` relative to the sink's clock.
    pub fn sweep(&self, retention: chrono::Duration) -> usize {
        self.evict_older_than(self.clock.now() - retention)
    }
}
