use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use shared::error::ChatError;
use tracing::debug;

/// Pure retry decision: given an attempt count (starting at 1) and the error
/// that failed it, decide whether to retry and after what delay.
pub trait RetryPolicy: Send + Sync {
    fn should_retry(&self, attempt: u32, error: &ChatError) -> bool;
    fn retry_timeout(&self, attempt: u32, error: &ChatError) -> Duration;
}

/// Default policy: never retry. Giving up here means "retry later when
/// connectivity recovers", which is the sync manager's job.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetryPolicy;

impl RetryPolicy for NoRetryPolicy {
    fn should_retry(&self, _attempt: u32, _error: &ChatError) -> bool {
        false
    }

    fn retry_timeout(&self, _attempt: u32, _error: &ChatError) -> Duration {
        Duration::ZERO
    }
}

/// Attempt-shifted doubling from `base_delay` up to `max_delay`, bounded at
/// `max_attempts` retries.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialRetryPolicy {
    base_delay: Duration,
    max_delay: Duration,
    max_attempts: u32,
}

impl ExponentialRetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts,
        }
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        let multiplier = 1_u64 << shift;
        let calculated = (self.base_delay.as_millis() as u64).saturating_mul(multiplier);
        Duration::from_millis(calculated.min(self.max_delay.as_millis() as u64))
    }
}

impl Default for ExponentialRetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30), 3)
    }
}

impl RetryPolicy for ExponentialRetryPolicy {
    fn should_retry(&self, attempt: u32, error: &ChatError) -> bool {
        error.is_temporary() && attempt <= self.max_attempts
    }

    fn retry_timeout(&self, attempt: u32, _error: &ChatError) -> Duration {
        self.delay_for_attempt(attempt)
    }
}

/// Wraps a single asynchronous unit of work and re-invokes it according to
/// the policy until success or a permanent failure.
#[derive(Clone)]
pub struct CallRetryService {
    policy: Arc<dyn RetryPolicy>,
}

impl CallRetryService {
    pub fn new(policy: Arc<dyn RetryPolicy>) -> Self {
        Self { policy }
    }

    pub async fn run<T, F, Fut>(&self, mut unit_of_work: F) -> Result<T, ChatError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ChatError>>,
    {
        let mut attempt = 1_u32;
        loop {
            match unit_of_work().await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_permanent() => {
                    debug!(attempt, %error, "retry: permanent failure, giving up");
                    return Err(error);
                }
                Err(error) => {
                    if !self.policy.should_retry(attempt, &error) {
                        debug!(attempt, %error, "retry: policy declined further attempts");
                        return Err(error);
                    }
                    let timeout = self.policy.retry_timeout(attempt, &error);
                    debug!(
                        attempt,
                        timeout_ms = timeout.as_millis() as u64,
                        %error,
                        "retry: waiting before next attempt"
                    );
                    if !timeout.is_zero() {
                        tokio::time::sleep(timeout).await;
                    }
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for CallRetryService {
    fn default() -> Self {
        Self::new(Arc::new(NoRetryPolicy))
    }
}
