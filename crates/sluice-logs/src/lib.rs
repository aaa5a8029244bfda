//! Sluice Logs
//!
//! Append-only, execution-scoped log streams. The orchestrator and step
//! runner append entries while an execution runs; readers attach at any time
//! and receive everything written so far followed by live entries until the
//! execution's log is closed.

pub mod sink;
pub mod sweeper;

pub use sink::{ExecutionLogSink, LogStream};
pub use sweeper::spawn_retention_sweeper;
