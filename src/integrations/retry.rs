//! Backoff table shared by reconnection and REST retries.

use super::error::ApiError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Fixed wait after a rate-limit response
pub const RATE_LIMIT_WAIT: Duration = Duration::from_secs(80);

const JITTER_MIN_MS: u64 = 60_000;
const JITTER_MAX_MS: u64 = 80_000;

/// Delay before the given (zero-based) attempt.
///
/// 0 → immediate, 1 → 2s, 2 → 10s, 3 → 30s, then a random 60–80s.
pub fn reconnect_delay(attempt: u32) -> Duration {
    match attempt {
        0 => Duration::ZERO,
        1 => Duration::from_secs(2),
        2 => Duration::from_secs(10),
        3 => Duration::from_secs(30),
        _ => Duration::from_millis(rand::thread_rng().gen_range(JITTER_MIN_MS..=JITTER_MAX_MS)),
    }
}

/// Sleep for `delay` unless `cancel` fires first.
///
/// Returns false if cancelled.
pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    if delay.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, runs out of
/// attempts, or `cancel` fires.
///
/// Transient failures wait per [`reconnect_delay`]; rate limits wait
/// [`RATE_LIMIT_WAIT`].
pub async fn with_retry<T, F, Fut>(
    context: &str,
    max_attempts: u32,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, ApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(ApiError::Cancelled);
        }

        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => e,
        };

        attempt += 1;
        if attempt >= max_attempts.max(1) {
            tracing::warn!("{} failed after {} attempts: {}", context, attempt, err);
            return Err(err);
        }

        let delay = match err {
            ApiError::RateLimited => RATE_LIMIT_WAIT,
            _ => reconnect_delay(attempt),
        };
        tracing::debug!(
            "{} failed ({}), retrying in {:?} (attempt {})",
            context,
            err,
            delay,
            attempt
        );

        if !sleep_or_cancel(delay, cancel).await {
            return Err(ApiError::Cancelled);
        }
    }
}
