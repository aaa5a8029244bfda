//! Logging and tracing for Sluice.
//!
//! Process-level diagnostics go through `tracing`; this crate installs the
//! subscriber (env filter, text or JSON output, optional OTLP export) and
//! provides span constructors carrying pipeline, execution and stage
//! attributes.

pub mod spans;
pub mod tracer;

pub use spans::{execution_span, stage_span, trigger_span};
pub use tracer::{LogFormat, OtlpConfig, TracerError, TracingConfig, init_tracer, shutdown_tracer};
