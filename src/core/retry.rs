//! Retry with exponential backoff for transient provider errors.
//!
//! Each attempt runs under a timeout; an elapsed timeout is treated as a
//! transient failure. Permanent errors return immediately.

use super::error::ProviderError;
use super::types::RetryPolicy;
use std::future::Future;
use std::time::Duration;

/// One retried attempt, kept for the event log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryNote {
    /// Attempt that failed (1-indexed)
    pub attempt: u32,
    pub backoff_ms: u64,
    pub error: String,
}

/// Final result of a retried operation.
#[derive(Debug)]
pub struct Attempted<T> {
    pub result: Result<T, ProviderError>,
    pub attempts: u32,
    pub retries: Vec<RetryNote>,
}

/// Delay after the failed attempt `attempt` (0-indexed): doubling, capped.
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    let ms = policy
        .initial_backoff_ms
        .saturating_mul(factor)
        .min(policy.max_backoff_ms);
    Duration::from_millis(ms)
}

/// Run `operation` until it succeeds, fails permanently, or attempts run out.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    timeout: Duration,
    mut operation: F,
) -> Attempted<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut retries = Vec::new();
    let mut attempt = 0u32;

    loop {
        let result = match tokio::time::timeout(timeout, operation()).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Transient(format!(
                "timed out after {}s",
                timeout.as_secs_f64()
            ))),
        };
        attempt += 1;

        match result {
            Ok(value) => {
                return Attempted {
                    result: Ok(value),
                    attempts: attempt,
                    retries,
                }
            }
            Err(e) if e.is_transient() && attempt < max_attempts => {
                let delay = backoff_delay(policy, attempt - 1);
                tracing::warn!(
                    attempt,
                    max_attempts,
                    backoff_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient failure, retrying"
                );
                retries.push(RetryNote {
                    attempt,
                    backoff_ms: delay.as_millis() as u64,
                    error: e.to_string(),
                });
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                return Attempted {
                    result: Err(e),
                    attempts: attempt,
                    retries,
                }
            }
        }
    }
}
