//! In-process counter store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::trace;

use super::{CounterStore, StoreError};
use crate::clock::{Clock, SystemClock};

#[derive(Debug, Clone)]
enum Value {
    Counter(u64),
    Text(String),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at_ms: u64,
}

/// A [`CounterStore`] backed by a concurrent map.
///
/// Expiry is lazy: stale entries are dropped when they are next touched, or
/// in bulk by [`MemoryStore::purge_expired`].
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Create a store on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store whose TTLs follow `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = self.clock.now_millis();
        self.entries
            .iter()
            .filter(|e| e.expires_at_ms > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired entry, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let before = self.entries.len();
        self.entries.retain(|_, e| e.expires_at_ms > now);
        before - self.entries.len()
    }

    fn expiry(&self, ttl: Duration) -> u64 {
        self.clock
            .now_millis()
            .saturating_add(ttl.as_millis().min(u64::MAX as u128) as u64)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        let now = self.clock.now_millis();
        let expires_at_ms = self.expiry(ttl);

        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Counter(0),
            expires_at_ms,
        });

        if entry.expires_at_ms <= now {
            *entry = Entry {
                value: Value::Counter(0),
                expires_at_ms,
            };
        }

        let count = match &entry.value {
            Value::Counter(n) => n + 1,
            Value::Text(raw) => raw.parse::<u64>().map_err(|_| {
                StoreError::Backend(format!("value at '{}' is not an integer", key))
            })? + 1,
        };
        entry.value = Value::Counter(count);

        trace!(key = %key, count, "Incremented counter");
        Ok(count)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = self.clock.now_millis();
        let value = match self.entries.get(key) {
            Some(entry) if entry.expires_at_ms > now => Some(match &entry.value {
                Value::Counter(n) => n.to_string(),
                Value::Text(raw) => raw.clone(),
            }),
            Some(_) => None,
            None => return Ok(None),
        };

        if value.is_none() {
            self.entries.remove_if(key, |_, e| e.expires_at_ms <= now);
        }
        Ok(value)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Text(value.to_string()),
                expires_at_ms: self.expiry(ttl),
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store_at(millis: i64) -> (Arc<ManualClock>, MemoryStore) {
        let clock = Arc::new(ManualClock::at_millis(millis));
        let store = MemoryStore::with_clock(clock.clone());
        (clock, store)
    }

    #[tokio::test]
    async fn test_increment_counts_up() {
        let (_clock, store) = store_at(0);
        let ttl = Duration::from_secs(10);

        assert_eq!(store.increment("k", ttl).await.unwrap(), 1);
        assert_eq!(store.increment("k", ttl).await.unwrap(), 2);
        assert_eq!(store.get("k").await.unwrap(), Some("2".to_string()));
    }

    #[tokio::test]
    async fn test_increment_restarts_after_ttl() {
        let (clock, store) = store_at(0);
        let ttl = Duration::from_secs(10);

        store.increment("k", ttl).await.unwrap();
        store.increment("k", ttl).await.unwrap();

        clock.advance(Duration::from_secs(10));
        assert_eq!(store.get("k").await.unwrap(), None);
        assert_eq!(store.increment("k", ttl).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_increment_keeps_original_expiry() {
        let (clock, store) = store_at(0);

        store.increment("k", Duration::from_secs(10)).await.unwrap();
        clock.advance(Duration::from_secs(9));
        store.increment("k", Duration::from_secs(10)).await.unwrap();
        clock.advance(Duration::from_secs(1));

        assert_eq!(store.increment("k", Duration::from_secs(10)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_set_and_get_text() {
        let (clock, store) = store_at(0);

        store
            .set_with_ttl("circuit:a", "{\"x\":1}", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(
            store.get("circuit:a").await.unwrap().as_deref(),
            Some("{\"x\":1}")
        );

        clock.advance(Duration::from_secs(6));
        assert_eq!(store.get("circuit:a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_increment_on_text_value_fails() {
        let (_clock, store) = store_at(0);
        store
            .set_with_ttl("k", "not-a-number", Duration::from_secs(5))
            .await
            .unwrap();

        let err = store.increment("k", Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, StoreError::Backend(_)));
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let (clock, store) = store_at(0);
        store.increment("short", Duration::from_secs(1)).await.unwrap();
        store.increment("long", Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.len(), 2);

        clock.advance(Duration::from_secs(2));
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
    }
}
