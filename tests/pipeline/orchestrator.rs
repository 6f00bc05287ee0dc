use std::sync::Arc;

use crate::support::fakes::{failed_response, ok_response, rate_limited_response, LengthExtractor, ScriptedFetcher};
use crate::support::helpers::{fast_config_with, init_tracing, read_queue, write_queue};
use pagehaul::{HaulConfig, Orchestrator, RetryDriver, Telemetry};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const ITEM_1: &str = "https://site.example/catalog/item-1.html";
const ITEM_2: &str = "https://site.example/catalog/item-2.html";
const ITEM_3: &str = "https://site.example/catalog/item-3.html";

fn orchestrator(
    config: HaulConfig,
    fetcher: Box<dyn pagehaul::PageFetcher>,
    shutdown: CancellationToken,
) -> Orchestrator {
    let config = Arc::new(config);
    let telemetry = Arc::new(Telemetry::default());
    let driver = RetryDriver::new(
        config.clone(),
        fetcher,
        None,
        telemetry.clone(),
        shutdown.clone(),
    );
    Orchestrator::new(config, driver, Box::new(LengthExtractor), telemetry, shutdown)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_item_stays_queued_while_others_complete() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let config = fast_config_with(dir.path(), "ph-orch-partial", |b| b);
    write_queue(config.queue_path(), &[ITEM_1, ITEM_2, ITEM_3]);

    let (fetcher, _calls) = ScriptedFetcher::new(|url, _index| {
        if url.contains("item-2") {
            failed_response("connection refused")
        } else {
            ok_response("<html><body>record</body></html>")
        }
    });

    let mut orchestrator = orchestrator(config.clone(), Box::new(fetcher), CancellationToken::new());
    let summary = orchestrator.run_all().await.unwrap();

    assert_eq!(summary.completed, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.produced.len(), 2);
    for path in &summary.produced {
        assert!(path.exists(), "output {} must exist", path.display());
    }

    assert_eq!(
        read_queue(config.queue_path()),
        vec![ITEM_2.to_owned()],
        "only the failing item may remain queued"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rerun_after_simulated_crash_loses_nothing() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let config = fast_config_with(dir.path(), "ph-orch-crash", |b| b);

    // Simulated crash point: item 1's output was written, but the process
    // died before the queue was rewritten, so the queue still lists it.
    std::fs::create_dir_all(config.output_dir()).unwrap();
    std::fs::write(
        config.output_dir().join("catalog_item-1.json"),
        "{\"stale\": true}",
    )
    .unwrap();
    write_queue(config.queue_path(), &[ITEM_1, ITEM_2, ITEM_3]);

    let (fetcher, _calls) =
        ScriptedFetcher::new(|_url, _index| ok_response("<html><body>record</body></html>"));
    let mut orchestrator = orchestrator(config.clone(), Box::new(fetcher), CancellationToken::new());
    let summary = orchestrator.run_all().await.unwrap();

    assert_eq!(summary.completed, 3, "reprocessing the item is acceptable");
    assert!(read_queue(config.queue_path()).is_empty());

    // The stale output has been replaced by a real record, not lost.
    let raw = std::fs::read_to_string(config.output_dir().join("catalog_item-1.json")).unwrap();
    let record: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(record["extracted"], true);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn blank_entries_are_skipped() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let config = fast_config_with(dir.path(), "ph-orch-blank", |b| b);
    write_queue(config.queue_path(), &["", "   ", ITEM_1]);

    let (fetcher, calls) =
        ScriptedFetcher::new(|_url, _index| ok_response("<html><body>record</body></html>"));
    let mut orchestrator = orchestrator(config.clone(), Box::new(fetcher), CancellationToken::new());
    let summary = orchestrator.run_all().await.unwrap();

    assert_eq!(summary.completed, 1);
    assert_eq!(summary.failed, 0);
    assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert!(!read_queue(config.queue_path()).contains(&ITEM_1.to_owned()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelled_run_touches_nothing() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let config = fast_config_with(dir.path(), "ph-orch-cancel", |b| b);
    write_queue(config.queue_path(), &[ITEM_1, ITEM_2]);

    let shutdown = CancellationToken::new();
    shutdown.cancel();

    let (fetcher, calls) =
        ScriptedFetcher::new(|_url, _index| ok_response("<html><body>record</body></html>"));
    let mut orchestrator = orchestrator(config.clone(), Box::new(fetcher), shutdown);
    let summary = orchestrator.run_all().await.unwrap();

    assert_eq!(summary.completed, 0);
    assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    assert_eq!(read_queue(config.queue_path()).len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mid_run_shutdown_leaves_the_item_queued_but_not_failed() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let config = fast_config_with(dir.path(), "ph-orch-interrupt", |b| b);
    write_queue(config.queue_path(), &[ITEM_1, ITEM_2]);

    // Shutdown arrives while the first item is in flight; the driver's
    // backoff then observes the cancellation.
    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    let (fetcher, calls) = ScriptedFetcher::new(move |_url, _index| {
        trigger.cancel();
        rate_limited_response()
    });

    let mut orchestrator = orchestrator(config.clone(), Box::new(fetcher), shutdown);
    let summary = orchestrator.run_all().await.unwrap();

    assert_eq!(summary.completed, 0);
    assert_eq!(
        summary.failed, 0,
        "an interrupted item must not count as a failure"
    );
    assert_eq!(orchestrator.telemetry().items_failed(), 0);
    assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(read_queue(config.queue_path()).len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_queue_file_fails_the_run() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let config = fast_config_with(dir.path(), "ph-orch-noqueue", |b| b);

    let (fetcher, _calls) = ScriptedFetcher::new(|_url, _index| ok_response("<html></html>"));
    let mut orchestrator = orchestrator(config, Box::new(fetcher), CancellationToken::new());

    assert!(orchestrator.run_all().await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exhausted_item_is_left_for_a_future_run() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let config = fast_config_with(dir.path(), "ph-orch-exhaust", |builder| builder.max_retries(2));
    write_queue(config.queue_path(), &[ITEM_1, ITEM_2]);

    let (fetcher, _calls) = ScriptedFetcher::new(|url, _index| {
        if url.contains("item-1") {
            rate_limited_response()
        } else {
            ok_response("<html><body>record</body></html>")
        }
    });

    let mut orchestrator = orchestrator(config.clone(), Box::new(fetcher), CancellationToken::new());
    let summary = orchestrator.run_all().await.unwrap();

    assert_eq!(summary.completed, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(
        read_queue(config.queue_path()),
        vec![ITEM_1.to_owned()],
        "the rate-limited item waits for a later run under fresh identities"
    );
}
