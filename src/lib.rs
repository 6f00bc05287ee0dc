//! pagehaul: a resilient page-collection pipeline.
//!
//! The pipeline repeatedly fetches pages from a single target site, rotating
//! its network identity when rate-limited, extracts structured records
//! through an injected extractor, and works through a durable JSON queue so
//! interrupted runs resume where they left off.

pub mod fetch;
pub mod identity;
pub mod pipeline;
pub mod runtime;

pub use fetch::{
    FetchError, FetchOutcome, FetchResponse, HttpPageFetcher, PageFetcher, RetryDriver,
};
pub use identity::{
    ConfigStore, ConfigStoreError, DaemonPaths, HealthProbe, IdentityConfig, IdentityManager,
    IdentitySession, Rotator, TunInterfaceProbe,
};
pub use pipeline::{Orchestrator, PageExtractor, Record, RunSummary, WorkQueue};
pub use runtime::config::{HaulConfig, HaulConfigBuilder, HaulConfigParams, JitterWindow};
pub use runtime::runner::Runner;
pub use runtime::secret::ElevationSecret;
pub use runtime::telemetry::{init_tracing, Telemetry, TelemetrySnapshot};
