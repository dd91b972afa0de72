//! Redis backend for the counter store.
//!
//! Counters are plain Redis integers. The increment and its expiry go out
//! as one `MULTI`/`EXEC` pipeline, and `PEXPIRE ... NX` only sets the TTL
//! on a fresh key, so the window a counter covers never slides forward.
//! `NX` needs Redis 7.0 or newer.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{cmd, pipe, Client, Cmd, Pipeline};
use tracing::{debug, trace};

use super::{CounterStore, StoreError};
use crate::retry::{with_retry, RetryPolicy};

pub struct RedisStore {
    connection: ConnectionManager,
    /// Prepended to every key, e.g. "myapp:" -> "myapp:rl:burst:user-1:170000280"
    prefix: String,
}

impl RedisStore {
    pub async fn new(connection_string: &str) -> Result<Self, StoreError> {
        Self::with_prefix(connection_string, None).await
    }

    /// Connect, retrying with the store policy before giving up.
    pub async fn with_prefix(connection_string: &str, prefix: Option<&str>) -> Result<Self, StoreError> {
        let client = Client::open(connection_string).map_err(backend)?;

        let connection = with_retry(&RetryPolicy::store(), || ConnectionManager::new(client.clone()))
            .await
            .map_err(backend)?;

        debug!(prefix = ?prefix, "Connected to Redis");
        Ok(Self {
            connection,
            prefix: prefix.unwrap_or("").to_string(),
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    #[inline]
    fn prefixed_key(&self, key: &str) -> String {
        prefixed(&self.prefix, key)
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        let mut conn = self.connection.clone();
        let key = self.prefixed_key(key);
        trace!(key = %key, "INCR");

        let (count,): (u64,) = increment_pipeline(&key, ttl)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(count)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection.clone();
        cmd("GET")
            .arg(self.prefixed_key(key))
            .query_async(&mut conn)
            .await
            .map_err(backend)
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.connection.clone();
        let keys: Vec<String> = keys.iter().map(|key| self.prefixed_key(key)).collect();
        cmd("MGET").arg(&keys).query_async(&mut conn).await.map_err(backend)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let _: () = set_command(&self.prefixed_key(key), value, ttl)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(())
    }
}

/// `INCR key` then `PEXPIRE key ttl NX`, atomically. Only the count comes back.
fn increment_pipeline(key: &str, ttl: Duration) -> Pipeline {
    let mut pipeline = pipe();
    pipeline
        .atomic()
        .incr(key, 1u64)
        .cmd("PEXPIRE")
        .arg(key)
        .arg(ttl_millis(ttl))
        .arg("NX")
        .ignore();
    pipeline
}

fn set_command(key: &str, value: &str, ttl: Duration) -> Cmd {
    let mut command = cmd("SET");
    command.arg(key).arg(value).arg("PX").arg(ttl_millis(ttl));
    command
}

fn prefixed(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}{}", prefix, key)
    }
}

/// Redis rejects a zero expiry, so sub-millisecond TTLs round up to 1 ms.
fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis().min(u64::MAX as u128) as u64).max(1)
}

fn backend(err: redis::RedisError) -> StoreError {
    StoreError::Backend(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packed(bytes: Vec<u8>) -> String {
        String::from_utf8_lossy(&bytes).into_owned()
    }

    #[test]
    fn test_prefixed_key() {
        assert_eq!(prefixed("", "rl:burst:u:7"), "rl:burst:u:7");
        assert_eq!(prefixed("myapp:", "rl:burst:u:7"), "myapp:rl:burst:u:7");
    }

    #[test]
    fn test_ttl_millis() {
        assert_eq!(ttl_millis(Duration::from_secs(12)), 12_000);
        assert_eq!(ttl_millis(Duration::from_micros(300)), 1);
        assert_eq!(ttl_millis(Duration::ZERO), 1);
    }

    #[test]
    fn test_increment_pipeline_sets_expiry_only_on_new_keys() {
        let wire = packed(increment_pipeline("rl:burst:u:7", Duration::from_secs(12)).get_packed_pipeline());

        assert!(wire.contains("MULTI"));
        assert!(wire.contains("EXEC"));

        let incr = wire.find("INCR").unwrap();
        let pexpire = wire.find("PEXPIRE").unwrap();
        assert!(incr < pexpire);

        let tail = &wire[pexpire..];
        assert!(tail.contains("\r\nrl:burst:u:7\r\n"));
        assert!(tail.contains("\r\n12000\r\n"));
        assert!(tail.contains("\r\nNX\r\n"));
    }

    #[test]
    fn test_set_command_uses_millisecond_expiry() {
        let wire = packed(set_command("cb:db", "{}", Duration::from_millis(1500)).get_packed_command());
        assert!(wire.starts_with("*5\r\n"));
        assert!(wire.contains("\r\nSET\r\n"));
        assert!(wire.contains("\r\nPX\r\n$4\r\n1500\r\n"));
    }

    #[tokio::test]
    #[ignore = "needs a Redis 7 server at REDIS_URL"]
    async fn test_counter_roundtrip_against_server() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".to_string());
        let store = RedisStore::with_prefix(&url, Some("bulwark-test:")).await.unwrap();
        let key = format!("counter:{}", std::process::id());

        assert_eq!(store.increment(&key, Duration::from_secs(5)).await.unwrap(), 1);
        assert_eq!(store.increment(&key, Duration::from_secs(5)).await.unwrap(), 2);
        assert_eq!(store.get(&key).await.unwrap().as_deref(), Some("2"));

        let values = store.get_many(&[key.clone(), "missing".to_string()]).await.unwrap();
        assert_eq!(values, vec![Some("2".to_string()), None]);
    }
}
