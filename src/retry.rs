//! Bounded exponential-backoff retry for transient failures.
//!
//! An explicit loop carries the attempt index, so cancellation, logging
//! and stack depth stay predictable regardless of retry count. Only
//! errors classified transient by `PlaceError::is_transient` are
//! retried; validation and business-logic errors fail fast.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::PlaceResult;

/// Delay before the retry that follows failed attempt `attempt`
/// (0-indexed): `base_delay * 2^attempt`.
pub fn backoff_delay(base_delay: Duration, attempt: u32) -> Duration {
    base_delay.saturating_mul(2u32.saturating_pow(attempt))
}

/// Run `operation` up to `max_attempts` times, sleeping with exponential
/// backoff between attempts. Transient errors are retried; anything else
/// is returned immediately. Every attempt is logged with its index and
/// the computed delay.
pub async fn retry_with_backoff<F, Fut, T>(
    op_name: &str,
    max_attempts: u32,
    base_delay: Duration,
    operation: F,
) -> PlaceResult<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = PlaceResult<T>>,
{
    let max_attempts = max_attempts.max(1);

    for attempt in 0..max_attempts {
        debug!(operation = op_name, attempt, "Attempting operation");
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    info!(operation = op_name, attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if err.is_transient() && attempt + 1 < max_attempts => {
                let delay = backoff_delay(base_delay, attempt);
                warn!(
                    operation = op_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Transient error, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                if err.is_transient() {
                    warn!(operation = op_name, attempt, error = %err, "Retry budget exhausted");
                } else {
                    debug!(operation = op_name, attempt, error = %err, "Fatal error, not retrying");
                }
                return Err(err);
            }
        }
    }

    unreachable!("loop returns on the last attempt")
}
