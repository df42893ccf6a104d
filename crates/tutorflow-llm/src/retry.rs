//! Transient-failure retry with exponential backoff and jitter

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

use tutorflow_utils::error::LlmError;

/// Retry policy for one logical LLM invocation.
///
/// Only transient errors (network, 5xx, 429, timeout) retry; permanent
/// client errors and schema violations surface immediately.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Delay before retry `attempt` (1-based): exponential growth capped at
    /// `max_delay`, multiplied by jitter in [0.5, 1.5).
    #[must_use]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let capped = exp.min(self.max_delay);
        let jitter: f64 = rand::thread_rng().gen_range(0.5..1.5);
        capped.mul_f64(jitter)
    }

    /// Run `op`, retrying transient failures up to `max_retries` times.
    ///
    /// A server-provided `retry-after` is honored when it exceeds the
    /// computed backoff.
    ///
    /// # Errors
    ///
    /// Returns the final error once retries are exhausted, or the first
    /// non-transient error.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, LlmError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LlmError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    let mut delay = self.backoff_delay(attempt);
                    if let LlmError::RateLimited {
                        retry_after: Some(after),
                    } = &err
                    {
                        delay = delay.max(*after);
                    }
                    debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient LLM failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = quick_policy(3)
            .run(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(LlmError::ServerError { status: 502 })
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = quick_policy(5)
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(LlmError::ClientError {
                        status: 400,
                        message: "bad".into(),
                    })
                }
            })
            .await;
        assert!(matches!(result, Err(LlmError::ClientError { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_returns_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = quick_policy(2)
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(LlmError::Transport("reset".into())) }
            })
            .await;
        assert!(matches!(result, Err(LlmError::Transport(_))));
        // initial call + 2 retries
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        };
        // Jitter is [0.5, 1.5), so bound-check rather than exact-check
        let d1 = policy.backoff_delay(1);
        assert!(d1 >= Duration::from_millis(50) && d1 < Duration::from_millis(150));
        let d5 = policy.backoff_delay(5);
        assert!(d5 <= Duration::from_millis(1500));
    }
}
