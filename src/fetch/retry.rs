use crate::fetch::classify::{self, FetchOutcome};
use crate::fetch::client::PageFetcher;
use crate::identity::rotation::Rotator;
use crate::runtime::config::HaulConfig;
use crate::runtime::telemetry::Telemetry;
use crate::runtime::timing::sleep_cancellable;
use std::fmt;
use std::sync::Arc;
#[cfg(test)]
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Terminal outcome of one logical fetch, after resilience is spent.
#[derive(Debug)]
pub enum FetchError {
    /// Every attempt ended rate-limited; the work item is worth requeueing
    /// for a later run under fresh identities.
    RetryExhausted { url: String, attempts: u32 },
    /// A non-throttling failure; retrying blindly would not help.
    Failed { url: String, message: String },
    /// The run was cancelled mid-sequence.
    Cancelled,
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::RetryExhausted { url, attempts } => {
                write!(f, "gave up fetching {url} after {attempts} rate-limited attempts")
            }
            FetchError::Failed { url, message } => {
                write!(f, "failed to fetch {url}: {message}")
            }
            FetchError::Cancelled => write!(f, "fetch cancelled"),
        }
    }
}

impl std::error::Error for FetchError {}

/// Wraps one logical "fetch usable HTML" operation with bounded retries,
/// exponential jittered backoff, and identity rotation on rate limiting.
///
/// The identity side is optional and best-effort: a driver without a rotator
/// (or one whose connects keep failing) still fetches, it just cannot switch
/// egress when throttled.
pub struct RetryDriver {
    fetcher: Box<dyn PageFetcher>,
    rotator: Option<Rotator>,
    config: Arc<HaulConfig>,
    telemetry: Arc<Telemetry>,
    shutdown: CancellationToken,
}

impl RetryDriver {
    pub fn new(
        config: Arc<HaulConfig>,
        fetcher: Box<dyn PageFetcher>,
        rotator: Option<Rotator>,
        telemetry: Arc<Telemetry>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            fetcher,
            rotator,
            config,
            telemetry,
            shutdown,
        }
    }

    /// Fetches `url`, retrying across rate limits up to the configured
    /// attempt budget and optional overall deadline.
    ///
    /// Rate-limited attempts rotate the identity and back off
    /// `2^attempt x backoff_base` before the next try. Non-throttling
    /// failures propagate immediately except on the final attempt, where
    /// any failure is terminal anyway.
    pub async fn fetch_with_retry(&mut self, url: &str) -> Result<String, FetchError> {
        let max_attempts = self.config.max_retries();
        let started = Instant::now();

        for attempt in 0..max_attempts {
            if self.shutdown.is_cancelled() {
                return Err(FetchError::Cancelled);
            }

            if let Some(deadline) = self.config.overall_deadline() {
                if started.elapsed() >= deadline {
                    tracing::warn!(url, attempt, "overall fetch deadline exceeded");
                    return Err(FetchError::RetryExhausted {
                        url: url.to_owned(),
                        attempts: attempt,
                    });
                }
            }

            if let Some(rotator) = &mut self.rotator {
                if !rotator.ensure_connected().await {
                    tracing::warn!(url, "proceeding without an identity endpoint");
                }
            }

            let pre_delay = self.config.pre_fetch_delay().sample();
            tracing::debug!(
                url,
                attempt,
                delay_ms = pre_delay.as_millis() as u64,
                "fetching page"
            );
            if !sleep_cancellable(pre_delay, &self.shutdown).await {
                return Err(FetchError::Cancelled);
            }

            let response = self.fetcher.fetch(url).await;

            match classify::classify(&response) {
                FetchOutcome::Success => {
                    self.telemetry.record_page_fetched();
                    tracing::info!(url, attempt, "page fetched");
                    return Ok(response.html);
                }
                FetchOutcome::RateLimited => {
                    self.handle_rate_limit(url, attempt).await?;
                }
                FetchOutcome::Failed { message } => {
                    let last_attempt = attempt + 1 >= max_attempts;
                    if !last_attempt && classify::is_rate_limit_message(&message) {
                        // Throttling dressed up as a generic failure.
                        self.handle_rate_limit(url, attempt).await?;
                        continue;
                    }

                    self.telemetry.record_fetch_failure();
                    tracing::warn!(url, attempt, message, "fetch failed");
                    return Err(FetchError::Failed {
                        url: url.to_owned(),
                        message,
                    });
                }
            }
        }

        tracing::warn!(url, max_attempts, "retry budget exhausted on rate limiting");
        Err(FetchError::RetryExhausted {
            url: url.to_owned(),
            attempts: max_attempts,
        })
    }

    /// Rotation plus exponential jittered backoff for one throttled attempt.
    async fn handle_rate_limit(&mut self, url: &str, attempt: u32) -> Result<(), FetchError> {
        self.telemetry.record_rate_limit_hit();

        let backoff = self
            .config
            .backoff_base()
            .sample()
            .saturating_mul(1u32 << attempt.min(16));
        tracing::warn!(
            url,
            attempt,
            backoff_secs = backoff.as_secs(),
            "rate limited; rotating identity and backing off"
        );

        match &mut self.rotator {
            Some(rotator) => {
                if !rotator.rotate().await {
                    tracing::warn!(url, "identity rotation failed; backing off regardless");
                }
            }
            None => {
                tracing::warn!(url, "no identity rotation available; backing off only");
            }
        }

        if !sleep_cancellable(backoff, &self.shutdown).await {
            return Err(FetchError::Cancelled);
        }
        Ok(())
    }

    /// Tears down any identity endpoint the driver brought up.
    pub async fn shutdown_identity(&mut self) {
        if let Some(rotator) = &mut self.rotator {
            rotator.shutdown_identity().await;
        }
    }
}

/// Backoff wait for a given attempt index, exposed for inspection in tests.
#[cfg(test)]
pub(crate) fn backoff_for_attempt(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1u32 << attempt.min(16))
}
