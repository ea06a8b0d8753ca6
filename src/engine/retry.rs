use std::future::Future;
use std::time::Duration;

use tracing::debug;

use super::EngineError;

/// Retry behaviour for operations that lost a race to another writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt (0 = no retries).
    pub max_retries: u32,
    /// Base delay in milliseconds, doubled per retry.
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 10,
            max_delay_ms: 200,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let multiplier = 1u64 << attempt.min(63);
        Duration::from_millis(
            self.base_delay_ms
                .saturating_mul(multiplier)
                .min(self.max_delay_ms),
        )
    }
}

/// Run `op`, retrying only [`EngineError::ConcurrentConflict`] with exponential backoff.
/// Every other outcome, success or failure, is returned as is.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &'static str,
    mut op: F,
) -> Result<T, EngineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                metrics::counter!(crate::observability::CONFLICT_RETRIES_TOTAL, "operation" => operation)
                    .increment(1);
                let delay = policy.delay(attempt);
                debug!(operation, attempt, ?delay, "retrying after conflict: {e}");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            outcome => return outcome,
        }
    }
}
