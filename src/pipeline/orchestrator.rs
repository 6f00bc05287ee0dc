use crate::fetch::retry::{FetchError, RetryDriver};
use crate::pipeline::extract::PageExtractor;
use crate::pipeline::output;
use crate::pipeline::queue::WorkQueue;
use crate::runtime::config::HaulConfig;
use crate::runtime::telemetry::Telemetry;
use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Outcome of one full pass over the work queue.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub completed: usize,
    pub failed: usize,
    pub produced: Vec<PathBuf>,
    pub elapsed: Duration,
}

/// Works through the durable queue one item at a time.
///
/// Per item: fetch with resilience, extract, persist the record, and only
/// then drop the item from the queue. A failed item stays queued and never
/// stops the batch; the identity endpoint is torn down on every exit path.
pub struct Orchestrator {
    config: Arc<HaulConfig>,
    driver: RetryDriver,
    extractor: Box<dyn PageExtractor>,
    telemetry: Arc<Telemetry>,
    shutdown: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        config: Arc<HaulConfig>,
        driver: RetryDriver,
        extractor: Box<dyn PageExtractor>,
        telemetry: Arc<Telemetry>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            driver,
            extractor,
            telemetry,
            shutdown,
        }
    }

    pub fn telemetry(&self) -> Arc<Telemetry> {
        self.telemetry.clone()
    }

    /// Processes every pending item in the configured queue file.
    ///
    /// Errors only when the queue itself cannot be loaded; individual item
    /// failures are counted, logged, and left behind in the queue for a
    /// future run.
    pub async fn run_all(&mut self) -> Result<RunSummary> {
        let result = self.run_inner().await;

        // Teardown runs on success, failure, and cancellation alike.
        self.driver.shutdown_identity().await;

        let summary = result?;
        tracing::info!(
            completed = summary.completed,
            failed = summary.failed,
            elapsed_secs = summary.elapsed.as_secs(),
            output_dir = %self.config.output_dir().display(),
            "run finished"
        );
        Ok(summary)
    }

    async fn run_inner(&mut self) -> Result<RunSummary> {
        let started = Instant::now();
        let mut queue = WorkQueue::load(self.config.queue_path()).await?;
        let pending = queue.snapshot();

        tracing::info!(
            queued = pending.len(),
            queue = %self.config.queue_path().display(),
            "starting run"
        );

        let mut summary = RunSummary::default();

        for (index, url) in pending.iter().enumerate() {
            // Cancellation is honored between items; an in-flight fetch is
            // allowed to finish on its own terms.
            if self.shutdown.is_cancelled() {
                tracing::info!(remaining = queue.len(), "run cancelled between items");
                break;
            }

            let url = url.trim();
            if url.is_empty() {
                continue;
            }

            tracing::info!(
                item = index + 1,
                total = pending.len(),
                url,
                "processing work item"
            );

            let item_started = Instant::now();
            match self.process_item(&mut queue, url).await {
                Ok(path) => {
                    summary.completed += 1;
                    summary.produced.push(path);
                    self.telemetry.record_item_completed();
                    tracing::info!(
                        url,
                        elapsed_secs = item_started.elapsed().as_secs_f64(),
                        remaining = queue.len(),
                        "work item completed"
                    );
                }
                // An interrupted item is neither completed nor failed; it
                // simply stays queued for the next run.
                Err(ItemError::Cancelled) => {
                    tracing::info!(url, "work item interrupted by shutdown");
                    break;
                }
                Err(ItemError::Retryable(message)) | Err(ItemError::Terminal(message)) => {
                    summary.failed += 1;
                    self.telemetry.record_item_failed();
                    tracing::warn!(
                        url,
                        elapsed_secs = item_started.elapsed().as_secs_f64(),
                        message,
                        "work item failed; left in the queue"
                    );
                }
            }
        }

        summary.elapsed = started.elapsed();
        Ok(summary)
    }

    /// One item end to end. The output write strictly precedes the queue
    /// removal: losing the process between the two reprocesses the item
    /// later instead of losing its output.
    async fn process_item(&mut self, queue: &mut WorkQueue, url: &str) -> Result<PathBuf, ItemError> {
        let html = self.driver.fetch_with_retry(url).await.map_err(|err| match err {
            FetchError::Cancelled => ItemError::Cancelled,
            FetchError::RetryExhausted { .. } => ItemError::Retryable(err.to_string()),
            FetchError::Failed { .. } => ItemError::Terminal(err.to_string()),
        })?;

        let record = self.extractor.extract(&html);

        let path = output::write_record(self.config.output_dir(), url, &record)
            .await
            .map_err(|err| ItemError::Terminal(format!("{err:#}")))?;

        if let Err(err) = queue.remove(url).await {
            // The output exists; a stuck queue write means the item will be
            // reprocessed next run, which is the acceptable direction.
            return Err(ItemError::Terminal(format!(
                "output written but queue update failed: {err:#}"
            )));
        }

        Ok(path)
    }
}

enum ItemError {
    /// Worth retrying in a later run (rate limiting never resolved).
    Retryable(String),
    /// A failure retrying would not fix; the item still stays queued so an
    /// operator can inspect or requeue deliberately.
    Terminal(String),
    Cancelled,
}
