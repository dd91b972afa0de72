//! The limiter chain: bypass, then burst, endpoint and global checks.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::bypass::TrustedSources;
use super::kind::LimiterKind;
use super::limiter::{LimitDecision, SlidingWindowLimiter};
use super::request::RateLimitRequest;
use crate::clock::Clock;
use crate::config::RateLimitingConfig;
use crate::store::CounterStore;

pub const HEADER_TYPE: &str = "X-RateLimit-Type";
pub const HEADER_LIMIT: &str = "X-RateLimit-Limit";
pub const HEADER_REMAINING: &str = "X-RateLimit-Remaining";
pub const HEADER_RESET: &str = "X-RateLimit-Reset";
pub const HEADER_RETRY_AFTER: &str = "Retry-After";

/// What to do when the counter store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreFailurePolicy {
    /// Let the request through with a full quota.
    #[default]
    FailOpen,
    /// Reject the request until the window would have reset.
    FailClosed,
}

/// Result of running a request through the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RateLimitOutcome {
    /// Trusted source, no limiter consulted.
    Bypassed,
    /// Every limiter passed. Carries the endpoint limiter's decision.
    Allowed { decision: LimitDecision },
    /// The first limiter that rejected.
    Rejected {
        decision: LimitDecision,
        retry_after_secs: u64,
    },
}

impl RateLimitOutcome {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, RateLimitOutcome::Rejected { .. })
    }

    pub fn decision(&self) -> Option<&LimitDecision> {
        match self {
            RateLimitOutcome::Bypassed => None,
            RateLimitOutcome::Allowed { decision } => Some(decision),
            RateLimitOutcome::Rejected { decision, .. } => Some(decision),
        }
    }

    /// Response headers describing the decision.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let Some(decision) = self.decision() else {
            return Vec::new();
        };

        let mut headers = vec![
            (HEADER_TYPE, decision.kind.to_string()),
            (HEADER_LIMIT, decision.limit.to_string()),
            (HEADER_REMAINING, decision.remaining.to_string()),
            (HEADER_RESET, decision.reset_at.to_rfc3339()),
        ];
        if let RateLimitOutcome::Rejected {
            retry_after_secs, ..
        } = self
        {
            headers.push((HEADER_RETRY_AFTER, retry_after_secs.to_string()));
        }
        headers
    }
}

/// Runs the burst, endpoint and global limiters for each request.
///
/// The first rejection short-circuits the chain. Checks that ran before it
/// have already consumed quota.
pub struct RateLimitGuard {
    limiter: SlidingWindowLimiter,
    trusted: TrustedSources,
    failure_policy: StoreFailurePolicy,
}

impl RateLimitGuard {
    pub fn new(store: Arc<dyn CounterStore>, clock: Arc<dyn Clock>) -> Self {
        Self::from_config(store, clock, &RateLimitingConfig::default())
    }

    pub fn from_config(
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        config: &RateLimitingConfig,
    ) -> Self {
        Self {
            limiter: SlidingWindowLimiter::new(store, clock, config.key_prefix.clone()),
            trusted: config.trusted_sources(),
            failure_policy: config.failure_policy,
        }
    }

    #[must_use]
    pub fn with_trusted(mut self, trusted: TrustedSources) -> Self {
        self.trusted = trusted;
        self
    }

    #[must_use]
    pub fn with_failure_policy(mut self, policy: StoreFailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Check every limiter that applies to `request`.
    pub async fn check(&self, request: &RateLimitRequest) -> RateLimitOutcome {
        if self
            .trusted
            .is_trusted(&request.identifier, request.user_agent.as_deref())
        {
            trace!(identifier = %request.identifier, "Trusted source, skipping rate limits");
            return RateLimitOutcome::Bypassed;
        }

        let selector = request.selector();
        let mut reported = None;

        for kind in request.chain() {
            let ceiling = selector.ceiling(kind);
            let decision = self.check_one(kind, ceiling, &request.identifier).await;

            if !decision.allowed {
                let retry_after_secs = decision.retry_after_secs(self.limiter.clock().now());
                debug!(
                    identifier = %request.identifier,
                    limiter = %kind,
                    retry_after_secs,
                    "Request rejected"
                );
                return RateLimitOutcome::Rejected {
                    decision,
                    retry_after_secs,
                };
            }

            // Without an endpoint limiter the global decision is reported.
            if kind == request.endpoint || !request.endpoint.is_endpoint() {
                reported = Some(decision);
            }
        }

        match reported {
            Some(decision) => RateLimitOutcome::Allowed { decision },
            None => RateLimitOutcome::Bypassed,
        }
    }

    async fn check_one(&self, kind: LimiterKind, ceiling: u64, identifier: &str) -> LimitDecision {
        match self.limiter.limit(kind, ceiling, identifier).await {
            Ok(decision) => decision,
            Err(err) => {
                let allowed = self.failure_policy == StoreFailurePolicy::FailOpen;
                warn!(
                    limiter = %kind,
                    identifier = %identifier,
                    error = %err,
                    policy = ?self.failure_policy,
                    "Counter store unavailable, applying failure policy"
                );
                LimitDecision::unenforced(kind, ceiling, allowed, self.limiter.clock().now())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ratelimit::tiers::CallerTier;
    use crate::store::{MemoryStore, StoreError};
    use async_trait::async_trait;
    use std::time::Duration;

    const START_MS: i64 = 1_700_002_800_000;

    struct DownStore;

    #[async_trait]
    impl CounterStore for DownStore {
        async fn increment(&self, _key: &str, _ttl: Duration) -> Result<u64, StoreError> {
            Err(StoreError::Backend("connection refused".into()))
        }

        async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
            Err(StoreError::Backend("connection refused".into()))
        }

        async fn set_with_ttl(&self, _: &str, _: &str, _: Duration) -> Result<(), StoreError> {
            Err(StoreError::Backend("connection refused".into()))
        }
    }

    fn guard() -> (Arc<ManualClock>, RateLimitGuard) {
        let clock = Arc::new(ManualClock::at_millis(START_MS));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        (clock.clone(), RateLimitGuard::new(store, clock))
    }

    #[tokio::test]
    async fn test_allowed_reports_endpoint_decision() {
        let (_clock, guard) = guard();
        let request = RateLimitRequest::new("user-1", LimiterKind::Search);

        let outcome = guard.check(&request).await;
        let decision = outcome.decision().unwrap();
        assert!(outcome.is_allowed());
        assert_eq!(decision.kind, LimiterKind::Search);
        assert_eq!(decision.limit, 60);
        assert_eq!(decision.remaining, 59);
    }

    #[tokio::test]
    async fn test_burst_rejects_first() {
        let (_clock, guard) = guard();
        let request = RateLimitRequest::new("user-1", LimiterKind::Api).with_tier(CallerTier::Pro);

        for _ in 0..10 {
            assert!(guard.check(&request).await.is_allowed());
        }

        let outcome = guard.check(&request).await;
        match &outcome {
            RateLimitOutcome::Rejected {
                decision,
                retry_after_secs,
            } => {
                assert_eq!(decision.kind, LimiterKind::Burst);
                assert_eq!(decision.remaining, 0);
                assert_eq!(*retry_after_secs, 11);
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_endpoint_limit_short_circuits_global() {
        let (clock, guard) = guard();
        let request = RateLimitRequest::new("user-2", LimiterKind::Auth);

        for _ in 0..5 {
            assert!(guard.check(&request).await.is_allowed());
            clock.advance(Duration::from_secs(11));
        }

        let outcome = guard.check(&request).await;
        assert_eq!(outcome.decision().unwrap().kind, LimiterKind::Auth);
        assert!(!outcome.is_allowed());
    }

    #[tokio::test]
    async fn test_trusted_source_bypasses() {
        let (_clock, guard) = guard();
        let guard = guard.with_trusted(TrustedSources::new().with_identifier("internal"));
        let request = RateLimitRequest::new("internal", LimiterKind::Burst);

        for _ in 0..50 {
            assert_eq!(guard.check(&request).await, RateLimitOutcome::Bypassed);
        }
        assert!(RateLimitOutcome::Bypassed.headers().is_empty());
    }

    #[tokio::test]
    async fn test_rejection_headers() {
        let (_clock, guard) = guard();
        let request = RateLimitRequest::new("user-3", LimiterKind::Write);

        let mut outcome = guard.check(&request).await;
        for _ in 0..10 {
            outcome = guard.check(&request).await;
        }

        let headers = outcome.headers();
        let get = |name: &str| {
            headers
                .iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| v.clone())
        };
        assert_eq!(get(HEADER_TYPE).as_deref(), Some("burst"));
        assert_eq!(get(HEADER_LIMIT).as_deref(), Some("10"));
        assert_eq!(get(HEADER_REMAINING).as_deref(), Some("0"));
        assert_eq!(get(HEADER_RETRY_AFTER).as_deref(), Some("11"));
        assert!(get(HEADER_RESET).unwrap().starts_with("2023-11-14T"));
    }

    #[tokio::test]
    async fn test_store_down_fails_open_by_default() {
        let clock = Arc::new(ManualClock::at_millis(START_MS));
        let guard = RateLimitGuard::new(Arc::new(DownStore), clock);
        let request = RateLimitRequest::new("user-4", LimiterKind::Api);

        let outcome = guard.check(&request).await;
        assert!(outcome.is_allowed());
        assert_eq!(outcome.decision().unwrap().remaining, 500);
    }

    #[tokio::test]
    async fn test_store_down_fails_closed_when_configured() {
        let clock = Arc::new(ManualClock::at_millis(START_MS));
        let guard = RateLimitGuard::new(Arc::new(DownStore), clock)
            .with_failure_policy(StoreFailurePolicy::FailClosed);
        let request = RateLimitRequest::new("user-5", LimiterKind::Api);

        let outcome = guard.check(&request).await;
        assert!(!outcome.is_allowed());
        assert_eq!(outcome.decision().unwrap().kind, LimiterKind::Burst);
    }
}
