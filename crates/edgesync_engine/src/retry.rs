//! Bounded retries for connector calls.

use crate::config::RetryConfig;
use crate::error::SyncResult;
use tracing::warn;

/// Runs `call` until it succeeds, fails with a non-retryable error, or
/// `retry.max_attempts` is exhausted.
pub fn with_retry<T, F>(
    retry: &RetryConfig,
    store: &str,
    operation: &str,
    mut call: F,
) -> SyncResult<T>
where
    F: FnMut() -> SyncResult<T>,
{
    let max_attempts = retry.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        if attempt > 0 {
            std::thread::sleep(retry.delay_for_attempt(attempt));
        }

        match call() {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt + 1 < max_attempts => {
                warn!(
                    store,
                    operation,
                    attempt = attempt + 1,
                    max_attempts,
                    error = %e,
                    "connector call failed, retrying"
                );
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
