use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::support::fakes::{
    failed_response, ok_response, rate_limited_response, FlipProbe, ScriptedFetcher,
};
use crate::support::helpers::{fake_daemon_script, fast_config_with, init_tracing, seed_endpoints};
use pagehaul::{
    FetchError, HaulConfig, IdentityManager, JitterWindow, RetryDriver, Rotator, Telemetry,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

struct Harness {
    config: Arc<HaulConfig>,
    telemetry: Arc<Telemetry>,
    shutdown: CancellationToken,
}

impl Harness {
    fn new(dir: &TempDir, label: &str) -> Self {
        Self::with_config(fast_config_with(dir.path(), label, |builder| builder))
    }

    fn with_config(config: HaulConfig) -> Self {
        Self {
            config: Arc::new(config),
            telemetry: Arc::new(Telemetry::default()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Rotator over an always-up probe: connects are satisfied by the
    /// pre-existing endpoint and rotations cycle without spawning anything.
    fn rotator(&self) -> Rotator {
        let (probe, _flag) = FlipProbe::new(true);
        let manager = IdentityManager::with_probe(
            self.config.clone(),
            None,
            self.shutdown.clone(),
            Box::new(probe),
        )
        .unwrap();
        Rotator::new(
            manager,
            self.config.rotation_cooldown(),
            self.telemetry.clone(),
            self.shutdown.clone(),
        )
    }

    fn driver(
        &self,
        fetcher: Box<dyn pagehaul::PageFetcher>,
        rotator: Option<Rotator>,
    ) -> RetryDriver {
        RetryDriver::new(
            self.config.clone(),
            fetcher,
            rotator,
            self.telemetry.clone(),
            self.shutdown.clone(),
        )
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn first_attempt_success_performs_zero_rotations() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    seed_endpoints(dir.path(), 2);
    let harness = Harness::new(&dir, "ph-retry-ok");

    let (fetcher, calls) = ScriptedFetcher::new(|_url, _index| ok_response("<html>content</html>"));
    let rotator = harness.rotator();
    let mut driver = harness.driver(Box::new(fetcher), Some(rotator));

    let html = driver
        .fetch_with_retry("https://site.example/page.html")
        .await
        .expect("first attempt succeeds");

    assert_eq!(html, "<html>content</html>");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(harness.telemetry.rotations(), 0);
    assert_eq!(harness.telemetry.pages_fetched(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn persistent_rate_limiting_is_bounded_and_exhausts() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    seed_endpoints(dir.path(), 3);
    let daemon = fake_daemon_script(dir.path());
    let harness = Harness::with_config(fast_config_with(dir.path(), "ph-retry-429", |builder| {
        builder.daemon_binary(daemon.to_str().unwrap())
    }));

    let (fetcher, calls) = ScriptedFetcher::new(|_url, _index| rate_limited_response());
    let rotator = harness.rotator();
    let mut driver = harness.driver(Box::new(fetcher), Some(rotator));

    let err = driver
        .fetch_with_retry("https://site.example/page.html")
        .await
        .expect_err("throttled forever must exhaust");

    assert!(matches!(err, FetchError::RetryExhausted { attempts: 3, .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 3, "attempt budget is bounded");
    assert_eq!(harness.telemetry.rate_limit_hits(), 3);
    assert_eq!(
        harness.telemetry.rotations(),
        3,
        "one rotation per rate-limited attempt, never unbounded"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ordinary_failures_propagate_without_blind_retries() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    seed_endpoints(dir.path(), 1);
    let harness = Harness::new(&dir, "ph-retry-fail");

    let (fetcher, calls) = ScriptedFetcher::new(|_url, _index| failed_response("connection refused"));
    let mut driver = harness.driver(Box::new(fetcher), None);

    let err = driver
        .fetch_with_retry("https://site.example/page.html")
        .await
        .expect_err("non-throttling failures are terminal");

    assert!(matches!(err, FetchError::Failed { .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 1, "no retry for such failures");
    assert_eq!(harness.telemetry.rotations(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn throttling_wording_in_failures_is_retried() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    seed_endpoints(dir.path(), 1);
    let harness = Harness::new(&dir, "ph-retry-wording");

    let (fetcher, calls) = ScriptedFetcher::new(|_url, index| {
        if index == 0 {
            failed_response("upstream rate limit reached")
        } else {
            ok_response("<html>recovered</html>")
        }
    });
    let mut driver = harness.driver(Box::new(fetcher), None);

    let html = driver
        .fetch_with_retry("https://site.example/page.html")
        .await
        .expect("second attempt succeeds");

    assert_eq!(html, "<html>recovered</html>");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(harness.telemetry.rate_limit_hits(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn overall_deadline_stops_new_attempts() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    seed_endpoints(dir.path(), 1);
    let config = fast_config_with(dir.path(), "ph-retry-deadline", |builder| {
        builder
            .max_retries(5)
            .overall_deadline(Duration::from_millis(50))
            .backoff_base(JitterWindow::new(
                Duration::from_millis(100),
                Duration::from_millis(100),
            ))
    });
    let harness = Harness::with_config(config);

    let (fetcher, calls) = ScriptedFetcher::new(|_url, _index| rate_limited_response());
    let mut driver = harness.driver(Box::new(fetcher), None);

    let err = driver
        .fetch_with_retry("https://site.example/page.html")
        .await
        .expect_err("deadline must stop the sequence");

    assert!(matches!(err, FetchError::RetryExhausted { .. }));
    assert_eq!(
        calls.load(Ordering::SeqCst),
        1,
        "the deadline preempts the remaining attempt budget"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelled_driver_returns_without_fetching() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    seed_endpoints(dir.path(), 1);
    let harness = Harness::new(&dir, "ph-retry-cancel");
    harness.shutdown.cancel();

    let (fetcher, calls) = ScriptedFetcher::new(|_url, _index| ok_response("<html></html>"));
    let mut driver = harness.driver(Box::new(fetcher), None);

    let err = driver
        .fetch_with_retry("https://site.example/page.html")
        .await
        .expect_err("cancelled run must not fetch");

    assert!(matches!(err, FetchError::Cancelled));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}
