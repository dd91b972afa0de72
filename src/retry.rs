//! Retry with linear or exponential backoff.
//!
//! [`with_retry`] runs an async operation up to `max_attempts` times and
//! hands back the last error untouched once attempts run out.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, warn};

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// `delay * attempt`
    Linear,
    /// `delay * 2^(attempt - 1)`
    #[default]
    Exponential,
}

/// Callback invoked with the 1-based number of the attempt that just failed.
pub type OnRetry = Arc<dyn Fn(u32) + Send + Sync>;

/// Retry behaviour for a single operation.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Base delay.
    pub delay: Duration,
    pub backoff: Backoff,
    /// Upper bound applied after backoff.
    pub max_delay: Option<Duration>,
    /// Replace each delay with a uniform draw from `0..=delay`.
    pub jitter: bool,
    pub on_retry: Option<OnRetry>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("delay", &self.delay)
            .field("backoff", &self.backoff)
            .field("max_delay", &self.max_delay)
            .field("jitter", &self.jitter)
            .field("on_retry", &self.on_retry.is_some())
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(1),
            backoff: Backoff::Exponential,
            max_delay: None,
            jitter: false,
            on_retry: None,
        }
    }
}

impl RetryPolicy {
    /// Quick retries for store round-trips.
    #[must_use]
    pub fn store() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_millis(50),
            max_delay: Some(Duration::from_millis(500)),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    #[must_use]
    pub fn with_on_retry<F>(mut self, on_retry: F) -> Self
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(on_retry));
        self
    }

    /// The delay to wait after the given failed attempt (1-based), before jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let delay = match self.backoff {
            Backoff::Linear => self.delay.saturating_mul(attempt),
            Backoff::Exponential => {
                let factor = 2u32.checked_pow(attempt - 1).unwrap_or(u32::MAX);
                self.delay.saturating_mul(factor)
            }
        };

        match self.max_delay {
            Some(max) => delay.min(max),
            None => delay,
        }
    }

    fn sleep_duration(&self, attempt: u32) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let millis = delay.as_millis().min(u64::MAX as u128) as u64;
        Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
    }
}

/// Run `operation` until it succeeds or `policy.max_attempts` is reached.
///
/// The error from the final attempt is returned as-is.
pub async fn with_retry<F, Fut, T, E>(policy: &RetryPolicy, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if attempt >= max_attempts => {
                warn!(attempts = attempt, error = %err, "Retries exhausted");
                return Err(err);
            }
            Err(err) => {
                if let Some(on_retry) = &policy.on_retry {
                    on_retry(attempt);
                }
                let wait = policy.sleep_duration(attempt);
                warn!(
                    attempt,
                    max_attempts,
                    error = %err,
                    wait_ms = wait.as_millis() as u64,
                    "Operation failed, retrying"
                );
                sleep(wait).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Clone, PartialEq)]
    struct TestError(String);

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    fn fast() -> RetryPolicy {
        RetryPolicy::default().with_delay(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_retry_succeeds_first_try() {
        let result: Result<i32, TestError> = with_retry(&fast(), || async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<i32, TestError> = with_retry(&fast(), || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(TestError(format!("fail {}", n)))
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_called_max_attempts_times() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), TestError> = with_retry(&fast(), || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                Err(TestError(format!("boom {}", n)))
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // The last error comes back unwrapped.
        assert_eq!(result.unwrap_err(), TestError("boom 3".to_string()));
    }

    #[tokio::test]
    async fn test_on_retry_sees_each_failed_attempt() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let policy = fast().with_on_retry(move |attempt| sink.lock().push(attempt));

        let _: Result<(), TestError> =
            with_retry(&policy, || async { Err(TestError("nope".into())) }).await;

        // No callback after the final attempt.
        assert_eq!(*seen.lock(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_zero_attempts_still_runs_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let policy = fast().with_max_attempts(0);

        let _: Result<(), TestError> = with_retry(&policy, || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(TestError("x".into())) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_exponential_delays() {
        let policy = RetryPolicy::default().with_delay(Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
    }

    #[test]
    fn test_linear_delays() {
        let policy = RetryPolicy::default()
            .with_delay(Duration::from_millis(100))
            .with_backoff(Backoff::Linear);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(300));
    }

    #[test]
    fn test_delay_caps_at_max() {
        let policy = RetryPolicy {
            delay: Duration::from_secs(1),
            max_delay: Some(Duration::from_secs(5)),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_within_delay() {
        let policy = RetryPolicy {
            delay: Duration::from_millis(100),
            jitter: true,
            ..RetryPolicy::default()
        };
        for _ in 0..50 {
            assert!(policy.sleep_duration(2) <= Duration::from_millis(200));
        }
    }
}
