//! Runtime glue: validated configuration, telemetry, the elevation secret,
//! cancellable timing helpers, and the runner that wires the pipeline to OS
//! signals.

pub mod config;
pub mod runner;
pub mod secret;
pub mod telemetry;
pub(crate) mod timing;
