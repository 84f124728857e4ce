use crate::config::RetrySettings;
use geosieve_error::{ErrorContext, Result};
use std::future::Future;
use std::time::Duration;
use tracing::{error, warn};

/// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
/// capped at `max_ms`.
pub fn next_retry_delay(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let multiplier = 2_u64.saturating_pow(attempt.saturating_sub(1));
    let delay = base_ms.saturating_mul(multiplier);
    Duration::from_millis(delay.min(max_ms))
}

/// Outcome of a retried operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Retried<T> {
    pub value: T,
    /// Total invocations, including the successful one.
    pub attempts: u32,
    /// Sum of all backoff sleeps.
    pub waited: Duration,
}

/// Execute an async operation, retrying only on lock errors.
///
/// Any other error is returned after the first attempt. When retries are
/// exhausted the last lock error is returned with a `Retry` context.
pub async fn retry_on_lock<T, F, Fut>(
    operation_name: &str,
    settings: RetrySettings,
    mut operation: F,
) -> Result<Retried<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = settings.max_attempts.max(1);
    let mut attempt = 0;
    let mut waited = Duration::ZERO;
    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => {
                return Ok(Retried {
                    value,
                    attempts: attempt,
                    waited,
                })
            }
            Err(e) if !e.is_lock() => return Err(e),
            Err(e) => {
                if attempt >= max_attempts {
                    error!(
                        target: "embedded",
                        "Operation '{}' still locked after {} attempts: {}",
                        operation_name, max_attempts, e
                    );
                    return Err(e.with_context(ErrorContext::Retry {
                        attempts: attempt,
                        waited_ms: waited.as_millis() as u64,
                    }));
                }
                let delay = next_retry_delay(attempt, settings.base_delay_ms, settings.max_delay_ms);
                warn!(
                    target: "embedded",
                    "Operation '{}' hit a lock. Retrying in {:?} (Attempt {}/{}): {}",
                    operation_name, delay, attempt, max_attempts, e
                );
                tokio::time::sleep(delay).await;
                waited += delay;
            }
        }
    }
}
