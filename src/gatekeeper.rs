//! The full request path: rate limits first, then the circuit breaker.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::circuit::{CircuitBreaker, CircuitError};
use crate::clock::Clock;
use crate::config::BulwarkConfig;
use crate::ratelimit::{
    LimitDecision, RateLimitGuard, RateLimitOutcome, RateLimitRequest, HEADER_RETRY_AFTER,
};
use crate::store::{CounterStore, RetryingStore};

pub type Headers = Vec<(&'static str, String)>;

/// How a guarded call ended, with the headers to send back.
#[derive(Debug)]
pub enum GuardResponse<T, E> {
    Completed { value: T, headers: Headers },
    Throttled { decision: LimitDecision, headers: Headers },
    CircuitOpen { retry_after: Duration, headers: Headers },
    Failed { error: E, headers: Headers },
}

impl<T, E> GuardResponse<T, E> {
    pub fn headers(&self) -> &Headers {
        match self {
            Self::Completed { headers, .. }
            | Self::Throttled { headers, .. }
            | Self::CircuitOpen { headers, .. }
            | Self::Failed { headers, .. } => headers,
        }
    }

    /// The HTTP status a server would answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Completed { .. } => 200,
            Self::Throttled { .. } => 429,
            Self::CircuitOpen { .. } => 503,
            Self::Failed { .. } => 500,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers()
            .iter()
            .find(|(header, _)| header.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Rate limiting and circuit breaking in front of an operation.
pub struct Gatekeeper {
    guard: RateLimitGuard,
    breaker: CircuitBreaker,
}

impl Gatekeeper {
    pub fn new(guard: RateLimitGuard, breaker: CircuitBreaker) -> Self {
        Self { guard, breaker }
    }

    /// Build both layers over one store and clock.
    ///
    /// Store calls are retried with `config.retry` before either layer sees
    /// a failure.
    pub fn from_config(
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        config: &BulwarkConfig,
    ) -> Self {
        let store: Arc<dyn CounterStore> = Arc::new(RetryingStore::new(store, config.retry.policy()));
        Self {
            guard: RateLimitGuard::from_config(
                Arc::clone(&store),
                Arc::clone(&clock),
                &config.rate_limiting,
            ),
            breaker: CircuitBreaker::new(store, clock, config.circuit_breaker.clone()),
        }
    }

    pub fn guard(&self) -> &RateLimitGuard {
        &self.guard
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Check the limiter chain for `request`, then run `operation` under the
    /// circuit for `operation_key`.
    ///
    /// A throttled request never reaches the breaker and never counts as a
    /// failure.
    pub async fn call<F, Fut, T, E>(
        &self,
        request: &RateLimitRequest,
        operation_key: &str,
        operation: F,
    ) -> GuardResponse<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let outcome = self.guard.check(request).await;
        let mut headers = outcome.headers();

        if let RateLimitOutcome::Rejected { decision, .. } = outcome {
            debug!(
                identifier = %request.identifier,
                limiter = %decision.kind,
                "Request throttled"
            );
            return GuardResponse::Throttled { decision, headers };
        }

        match self.breaker.execute(operation_key, operation).await {
            Ok(value) => GuardResponse::Completed { value, headers },
            Err(CircuitError::Open { retry_after, .. }) => {
                headers.push((HEADER_RETRY_AFTER, ceil_secs(retry_after).to_string()));
                GuardResponse::CircuitOpen {
                    retry_after,
                    headers,
                }
            }
            Err(CircuitError::Operation(error)) => GuardResponse::Failed { error, headers },
        }
    }

    /// Like [`call`](Self::call), but an open circuit or a failed operation
    /// degrades to `fallback`.
    pub async fn call_with_fallback<F, Fut, G, GFut, T, E>(
        &self,
        request: &RateLimitRequest,
        operation_key: &str,
        operation: F,
        fallback: G,
    ) -> GuardResponse<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        G: FnOnce() -> GFut,
        GFut: Future<Output = Result<T, E>>,
    {
        let outcome = self.guard.check(request).await;
        let headers = outcome.headers();

        if let RateLimitOutcome::Rejected { decision, .. } = outcome {
            return GuardResponse::Throttled { decision, headers };
        }

        match self
            .breaker
            .execute_with_fallback(operation_key, operation, fallback)
            .await
        {
            Ok(value) => GuardResponse::Completed { value, headers },
            Err(error) => GuardResponse::Failed { error, headers },
        }
    }
}

fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::CircuitBreakerConfig;
    use crate::ratelimit::{LimiterKind, StoreFailurePolicy, HEADER_REMAINING, HEADER_TYPE};
    use crate::store::{MemoryStore, StoreError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn gatekeeper() -> (Gatekeeper, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at_millis(1_700_002_800_000));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let mut config = BulwarkConfig::default();
        config.circuit_breaker = CircuitBreakerConfig {
            failure_threshold: 2,
            ..CircuitBreakerConfig::default()
        };
        (Gatekeeper::from_config(store, clock.clone(), &config), clock)
    }

    #[tokio::test]
    async fn test_completed_call_carries_endpoint_headers() {
        let (gate, _) = gatekeeper();
        let request = RateLimitRequest::new("user-1", LimiterKind::Search);

        let response: GuardResponse<u32, String> =
            gate.call(&request, "search", || async { Ok(7) }).await;

        assert_eq!(response.status_code(), 200);
        assert_eq!(response.header(HEADER_TYPE), Some("search"));
        assert_eq!(response.header(HEADER_REMAINING), Some("59"));
        assert!(response.header(HEADER_RETRY_AFTER).is_none());
    }

    #[tokio::test]
    async fn test_burst_throttles_before_operation_runs() {
        let (gate, _) = gatekeeper();
        let request = RateLimitRequest::new("user-1", LimiterKind::Api);

        for _ in 0..10 {
            let response: GuardResponse<(), String> =
                gate.call(&request, "api", || async { Ok(()) }).await;
            assert!(response.is_completed());
        }

        let mut ran = false;
        let response: GuardResponse<(), String> = gate
            .call(&request, "api", || {
                ran = true;
                async { Ok(()) }
            })
            .await;

        assert!(!ran);
        assert_eq!(response.status_code(), 429);
        assert_eq!(response.header(HEADER_TYPE), Some("burst"));
        assert_eq!(response.header(HEADER_REMAINING), Some("0"));
        assert!(response.header(HEADER_RETRY_AFTER).is_some());
    }

    #[tokio::test]
    async fn test_open_circuit_maps_to_503() {
        let (gate, _) = gatekeeper();
        let request = RateLimitRequest::new("user-1", LimiterKind::Write);

        for _ in 0..2 {
            let response: GuardResponse<(), String> = gate
                .call(&request, "db", || async { Err("boom".to_string()) })
                .await;
            assert_eq!(response.status_code(), 500);
        }

        let response: GuardResponse<(), String> =
            gate.call(&request, "db", || async { Ok(()) }).await;
        assert_eq!(response.status_code(), 503);
        assert_eq!(response.header(HEADER_RETRY_AFTER), Some("60"));
        assert_eq!(response.header(HEADER_TYPE), Some("write"));
    }

    #[tokio::test]
    async fn test_fallback_replaces_failure() {
        let (gate, _) = gatekeeper();
        let request = RateLimitRequest::new("user-1", LimiterKind::Api);

        let response: GuardResponse<&str, String> = gate
            .call_with_fallback(
                &request,
                "profile",
                || async { Err("down".to_string()) },
                || async { Ok("cached") },
            )
            .await;

        match response {
            GuardResponse::Completed { value, .. } => assert_eq!(value, "cached"),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    /// Fails the first `failures` increments, then defers to a memory store.
    struct FlakyStore {
        inner: MemoryStore,
        failures: AtomicU32,
    }

    #[async_trait]
    impl CounterStore for FlakyStore {
        async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(StoreError::Backend("connection reset".into()));
            }
            self.inner.increment(key, ttl).await
        }

        async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
            self.inner.get(key).await
        }

        async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
            self.inner.set_with_ttl(key, value, ttl).await
        }
    }

    #[tokio::test]
    async fn test_store_calls_are_retried_with_configured_policy() {
        let clock = Arc::new(ManualClock::at_millis(1_700_002_800_000));
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::with_clock(clock.clone()),
            failures: AtomicU32::new(1),
        });
        let mut config = BulwarkConfig::default();
        config.rate_limiting.failure_policy = StoreFailurePolicy::FailClosed;
        config.retry.delay_ms = 1;

        let gate = Gatekeeper::from_config(store, clock, &config);
        let request = RateLimitRequest::new("user-1", LimiterKind::Search);
        let response: GuardResponse<u32, String> =
            gate.call(&request, "search", || async { Ok(7) }).await;

        // Fail-closed would have throttled had the first error surfaced.
        assert_eq!(response.status_code(), 200);
        assert_eq!(response.header(HEADER_REMAINING), Some("59"));
    }

    #[test]
    fn test_ceil_secs() {
        assert_eq!(ceil_secs(Duration::from_millis(1)), 1);
        assert_eq!(ceil_secs(Duration::from_secs(60)), 60);
        assert_eq!(ceil_secs(Duration::from_millis(60_001)), 61);
        assert_eq!(ceil_secs(Duration::ZERO), 1);
    }
}
