//! Sluice Core
//!
//! Domain types, ports, and error handling for the Sluice pipeline engine.
//! This crate has minimal dependencies and defines the shared vocabulary
//! used by the store, runner, and scheduler crates.

pub mod clock;
pub mod dataset;
pub mod datasource;
pub mod error;
pub mod execution;
pub mod ids;
pub mod log;
pub mod pipeline;
pub mod ports;
pub mod record;
pub mod schedule;

pub use error::{Error, Result};
pub use ids::*;
