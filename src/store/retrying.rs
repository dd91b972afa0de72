//! Store decorator that retries transient failures.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{CounterStore, StoreError};
use crate::retry::{with_retry, RetryPolicy};

/// Wraps another [`CounterStore`] and retries each command.
///
/// Once retries are exhausted the last error is wrapped in
/// [`StoreError::Unavailable`], so callers can tell a flaky command from a
/// dead backend.
pub struct RetryingStore {
    inner: Arc<dyn CounterStore>,
    policy: RetryPolicy,
}

impl RetryingStore {
    pub fn new(inner: Arc<dyn CounterStore>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    fn exhausted(&self, err: StoreError) -> StoreError {
        StoreError::Unavailable {
            attempts: self.policy.max_attempts.max(1),
            source: Box::new(err),
        }
    }
}

#[async_trait]
impl CounterStore for RetryingStore {
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        with_retry(&self.policy, || self.inner.increment(key, ttl))
            .await
            .map_err(|e| self.exhausted(e))
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        with_retry(&self.policy, || self.inner.get(key))
            .await
            .map_err(|e| self.exhausted(e))
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        with_retry(&self.policy, || self.inner.set_with_ttl(key, value, ttl))
            .await
            .map_err(|e| self.exhausted(e))
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        with_retry(&self.policy, || self.inner.get_many(keys))
            .await
            .map_err(|e| self.exhausted(e))
    }
}
