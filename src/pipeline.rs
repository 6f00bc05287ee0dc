//! Work orchestration: the durable queue, the extraction seam, output
//! persistence, and the per-item processing loop.

pub mod extract;
pub mod orchestrator;
pub mod output;
pub mod queue;

pub use extract::{PageExtractor, Record};
pub use orchestrator::{Orchestrator, RunSummary};
pub use queue::WorkQueue;
