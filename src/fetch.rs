//! Page transport and resilience: the fetch seam, outcome classification,
//! and the retry/backoff driver that coordinates rotation with rate limits.

pub mod classify;
pub mod client;
pub mod retry;

pub use classify::{classify, is_error_page, is_rate_limit_message, FetchOutcome};
pub use client::{FetchResponse, HttpPageFetcher, PageFetcher};
pub use retry::{FetchError, RetryDriver};
