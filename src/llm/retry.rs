use std::future::Future;
use std::time::Duration;

use tokio_retry2::strategy::{ExponentialBackoff, jitter};
use tokio_retry2::{Retry, RetryError};
use tracing::warn;

use super::LlmError;

/// Exponential backoff: delay n is `base^n * factor` milliseconds, capped at
/// `max_delay`, jittered, for at most `retries` extra attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub base: u64,
    pub factor: u64,
    pub max_delay: Duration,
    pub retries: usize,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self { base: 2, factor: 1, max_delay: Duration::ZERO, retries: 0 }
    }

    /// 2 s, 4 s, 8 s (four tries in total), capped at 32 s.
    pub fn outline() -> Self {
        Self { base: 2, factor: 1000, max_delay: Duration::from_secs(32), retries: 3 }
    }

    /// 1 s then 2 s, capped at 20 s.
    pub fn build() -> Self {
        Self { base: 2, factor: 500, max_delay: Duration::from_secs(20), retries: 2 }
    }

    /// 1, 2, 4, 8 s.
    pub fn narration() -> Self {
        Self { base: 2, factor: 500, max_delay: Duration::from_secs(8), retries: 4 }
    }

    /// 2 s then 4 s.
    pub fn tts() -> Self {
        Self { base: 2, factor: 1000, max_delay: Duration::from_secs(30), retries: 2 }
    }

    pub fn strategy(&self) -> impl Iterator<Item = Duration> + use<> {
        ExponentialBackoff::from_millis(self.base)
            .factor(self.factor)
            .max_delay(self.max_delay)
            .map(jitter)
            .take(self.retries)
    }
}

pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T, LlmError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LlmError>>,
{
    Retry::spawn(policy.strategy(), || {
        let attempt = op();
        async move {
            match attempt.await {
                Ok(v) => Ok(v),
                Err(e) if e.is_retryable() => {
                    warn!("{}: transient error, will retry: {}", label, e);
                    Err(RetryError::Transient { err: e, retry_after: None })
                }
                Err(e) => {
                    warn!("{}: permanent error, failing immediately: {}", label, e);
                    Err(RetryError::Permanent(e))
                }
            }
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn instant(retries: usize) -> RetryPolicy {
        RetryPolicy { base: 1, factor: 1, max_delay: Duration::from_millis(1), retries }
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let calls = AtomicUsize::new(0);
        let out = with_retry(&instant(3), "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { if n < 2 { Err(LlmError::Timeout) } else { Ok(n) } }
        })
        .await
        .unwrap();
        assert_eq!(out, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_stop_immediately() {
        let calls = AtomicUsize::new(0);
        let err = with_retry(&instant(3), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(LlmError::Status { status: 400, body: "bad".into() }) }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, LlmError::Status { status: 400, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_budget() {
        let calls = AtomicUsize::new(0);
        let res = with_retry(&instant(2), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(LlmError::Timeout) }
        })
        .await;
        assert!(res.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
