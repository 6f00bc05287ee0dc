use std::time::Duration;
use tokio::task::yield_now;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Sleeps for `delay` unless the token fires first.
///
/// Returns `true` when the full delay elapsed and `false` when the sleep was
/// cut short by cancellation. Every wait in the pipeline (readiness polls,
/// pre-fetch jitter, backoff, rotation cooldown) goes through here so shutdown
/// is never stuck behind a timer.
pub(crate) async fn sleep_cancellable(delay: Duration, shutdown: &CancellationToken) -> bool {
    if shutdown.is_cancelled() {
        return false;
    }

    if delay.is_zero() {
        yield_now().await;
        return true;
    }

    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = sleep(delay) => true,
    }
}
