//! Counter/KV store abstraction.
//!
//! Limiters and circuit breakers only need three primitives from the shared
//! store: an atomic increment that sets a TTL, a plain get, and a set with
//! TTL. Anything that offers those (Redis, Upstash, an in-memory map) can
//! back the layer.

mod memory;
#[cfg(feature = "redis")]
mod redis_store;
mod retrying;

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisStore;
pub use retrying::RetryingStore;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors raised by a counter store.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The backend rejected or failed the command.
    #[error("store backend error: {0}")]
    Backend(String),

    /// The backend stayed unreachable across every retry.
    #[error("store unavailable after {attempts} attempts: {source}")]
    Unavailable {
        attempts: u32,
        #[source]
        source: Box<StoreError>,
    },
}

/// The store primitives used by the limiter and the circuit breaker.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increment `key` and return the new count.
    ///
    /// If the key does not exist (or has expired) it starts at 1 and lives
    /// for `ttl`. Existing keys keep their original expiry.
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, StoreError>;

    /// Read the raw value stored under `key`.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Overwrite `key` with `value` and a fresh `ttl`.
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Read several keys, in order.
    ///
    /// Backends with a multi-key read should override this.
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            values.push(self.get(key).await?);
        }
        Ok(values)
    }
}
