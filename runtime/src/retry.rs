//! Randomized retry for optimistic-concurrency conflicts.
//!
//! When two denormalizers race on the same view model, the loser's commit is
//! rejected and the whole load/apply/commit cycle starts over after a random
//! pause. The pause is uniform in `[0, window]` so competing writers spread
//! out instead of colliding again in lockstep.
//!
//! Retries are unbounded for retryable errors; any other error is returned on
//! the spot.
//!
//! # Example
//!
//! ```rust
//! use denormalizer_runtime::retry::retry_with_jitter;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), String> {
//! let result = retry_with_jitter(
//!     Duration::from_millis(50),
//!     || async { Ok::<_, String>(42) },
//!     |err: &String| err.contains("conflict"),
//! )
//! .await?;
//! assert_eq!(result, 42);
//! # Ok(())
//! # }
//! ```

use crate::metrics::ViewBuilderMetrics;
use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;

/// A random delay uniformly drawn from `[0, window]` in whole milliseconds.
#[must_use]
pub fn jitter_delay(window: Duration) -> Duration {
    let max_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

/// Run `operation` until it succeeds or fails with a non-retryable error.
///
/// Each retryable failure sleeps for [`jitter_delay`]`(window)` before the
/// next attempt.
///
/// # Errors
///
/// Returns the first error for which `is_retryable` is `false`.
pub async fn retry_with_jitter<F, Fut, T, E, P>(
    window: Duration,
    mut operation: F,
    is_retryable: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt: usize = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::debug!(attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(err) => {
                if !is_retryable(&err) {
                    return Err(err);
                }

                let delay = jitter_delay(window);
                tracing::debug!(
                    attempt,
                    delay_ms = delay.as_millis(),
                    error = %err,
                    "Conflict, retrying after jitter"
                );
                ViewBuilderMetrics::record_retry();

                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
