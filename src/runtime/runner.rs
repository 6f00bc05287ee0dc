use crate::fetch::client::{HttpPageFetcher, PageFetcher};
use crate::fetch::retry::RetryDriver;
use crate::identity::manager::IdentityManager;
use crate::identity::rotation::Rotator;
use crate::pipeline::extract::PageExtractor;
use crate::pipeline::orchestrator::{Orchestrator, RunSummary};
use crate::runtime::config::HaulConfig;
use crate::runtime::secret::ElevationSecret;
use crate::runtime::telemetry::{spawn_metrics_reporter, Telemetry};
use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Wires the whole pipeline together and handles OS signals for graceful
/// shutdown.
///
/// A root [`CancellationToken`] propagates through every component (manager
/// readiness polls, backoff sleeps, cooldowns, the item loop), so one Ctrl-C
/// stops the run at the next suspension point and still tears the identity
/// endpoint down.
pub struct Runner {
    orchestrator: Orchestrator,
    telemetry: Arc<Telemetry>,
    shutdown: CancellationToken,
    metrics_interval: std::time::Duration,
}

impl Runner {
    /// Builds the default production pipeline: identity manager over the
    /// real tunnel probe, HTTP page fetcher, retry driver, orchestrator.
    ///
    /// Errors when the identity daemon binary is missing, the one hard
    /// precondition, or when the HTTP client cannot be constructed.
    pub fn new(
        config: HaulConfig,
        extractor: Box<dyn PageExtractor>,
        elevation: Option<ElevationSecret>,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let shutdown = CancellationToken::new();
        let telemetry = Arc::new(Telemetry::default());

        let manager = IdentityManager::new(config.clone(), elevation, shutdown.clone())?;
        let rotator = Rotator::new(
            manager,
            config.rotation_cooldown(),
            telemetry.clone(),
            shutdown.clone(),
        );
        let fetcher: Box<dyn PageFetcher> = Box::new(HttpPageFetcher::new(&config)?);
        let driver = RetryDriver::new(
            config.clone(),
            fetcher,
            Some(rotator),
            telemetry.clone(),
            shutdown.clone(),
        );
        let orchestrator = Orchestrator::new(
            config.clone(),
            driver,
            extractor,
            telemetry.clone(),
            shutdown.clone(),
        );

        Ok(Self {
            orchestrator,
            telemetry,
            shutdown,
            metrics_interval: config.metrics_interval(),
        })
    }

    /// Wraps an already-assembled orchestrator; used by tests and embedders
    /// that inject their own components.
    pub fn with_orchestrator(orchestrator: Orchestrator, shutdown: CancellationToken) -> Self {
        let telemetry = orchestrator.telemetry();
        Self {
            orchestrator,
            telemetry,
            shutdown,
            metrics_interval: crate::runtime::telemetry::DEFAULT_METRICS_INTERVAL,
        }
    }

    /// Returns a clone of the root shutdown token so external callers can
    /// integrate their own cancellation strategies.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn telemetry(&self) -> Arc<Telemetry> {
        self.telemetry.clone()
    }

    /// Runs the queue to completion.
    pub async fn run(&mut self) -> Result<RunSummary> {
        self.orchestrator.run_all().await
    }

    /// Runs the queue to completion, stopping early on Ctrl-C (SIGINT).
    ///
    /// The signal cancels the root token; the orchestrator finishes the
    /// in-flight item boundary, disconnects the identity endpoint, and
    /// returns the partial summary.
    pub async fn run_until_ctrl_c(&mut self) -> Result<RunSummary> {
        let reporter = spawn_metrics_reporter(
            self.telemetry.clone(),
            self.shutdown.clone(),
            self.metrics_interval,
        );

        let shutdown = self.shutdown.clone();
        let signal_task = tokio::spawn(async move {
            if signal::ctrl_c().await.is_ok() {
                tracing::info!("Ctrl-C received; finishing the current item and shutting down");
                shutdown.cancel();
            }
        });

        let result = self.orchestrator.run_all().await;

        self.shutdown.cancel();
        signal_task.abort();
        let _ = reporter.await;

        result
    }
}
