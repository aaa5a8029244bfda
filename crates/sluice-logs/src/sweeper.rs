//! Periodic retention sweep for execution logs.

use crate::sink::ExecutionLogSink;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Spawn a task that evicts entries older than `retention` every `every`,
/// until `shutdown` is cancelled.
pub fn spawn_retention_sweeper(
    sink: Arc<ExecutionLogSink>,
    retention: chrono::Duration,
    every: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            retention_secs = retention.num_seconds(),
            interval_secs = every.as_secs(),
            "Starting log retention sweeper"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = sink.sweep(retention);
                    debug!(removed, "Log retention sweep complete");
                }
                _ = shutdown.cancelled() => {
                    info!("Log retention sweeper shutting down");
                    break;
                }
            }
        }
    })
}
