//! Per-key circuit breaker with state persisted in the counter store.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::state::{CircuitSnapshot, CircuitState};
use crate::clock::Clock;
use crate::config::CircuitBreakerConfig;
use crate::store::CounterStore;

/// Error returned by a circuit-protected call.
#[derive(Debug, Error)]
pub enum CircuitError<E> {
    /// The circuit is open and the operation was not attempted.
    #[error("circuit '{key}' is open, retry in {retry_after:?}")]
    Open { key: String, retry_after: Duration },

    /// The operation ran and failed.
    #[error("{0}")]
    Operation(E),
}

impl<E> CircuitError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, CircuitError::Open { .. })
    }

    /// The operation's own error, if it ran.
    pub fn into_operation(self) -> Option<E> {
        match self {
            CircuitError::Operation(err) => Some(err),
            CircuitError::Open { .. } => None,
        }
    }
}

/// Holds the single half-open probe slot for a key until dropped.
struct ProbeGuard {
    probes: Arc<DashMap<String, ()>>,
    key: String,
}

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        self.probes.remove(&self.key);
    }
}

enum Admission {
    Allowed { probe: Option<ProbeGuard> },
    Rejected { retry_after: Duration },
}

/// A circuit breaker keyed by operation.
///
/// State lives in the shared store so every process sees trips made by the
/// others. A local mirror of the last snapshot seen for each key keeps the
/// breaker working when the store is unreachable: a circuit opened locally
/// stays open, anything else behaves as closed.
///
/// Reads and writes of the shared state are not atomic. Concurrent callers
/// may lose a failure count now and then.
pub struct CircuitBreaker {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    config: CircuitBreakerConfig,
    mirror: DashMap<String, CircuitSnapshot>,
    probes: Arc<DashMap<String, ()>>,
}

impl CircuitBreaker {
    pub fn new(
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        config: CircuitBreakerConfig,
    ) -> Self {
        Self {
            store,
            clock,
            config,
            mirror: DashMap::new(),
            probes: Arc::new(DashMap::new()),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Run `operation` under the circuit for `key`.
    ///
    /// While the circuit is open the operation is not called and
    /// [`CircuitError::Open`] is returned. Operation errors are recorded and
    /// handed back as [`CircuitError::Operation`].
    pub async fn execute<F, Fut, T, E>(&self, key: &str, operation: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let probe = match self.admit(key).await {
            Admission::Allowed { probe } => probe,
            Admission::Rejected { retry_after } => {
                debug!(circuit = %key, ?retry_after, "Circuit open, failing fast");
                return Err(CircuitError::Open {
                    key: key.to_string(),
                    retry_after,
                });
            }
        };

        let result = operation().await;
        if result.is_ok() {
            self.record_success(key, probe.is_some()).await;
        } else {
            self.record_failure(key, probe.is_some()).await;
        }
        drop(probe);

        result.map_err(CircuitError::Operation)
    }

    /// Like [`execute`](Self::execute), but degrade to `fallback` instead of
    /// returning an error.
    ///
    /// An open circuit goes straight to the fallback without recording a
    /// failure. A failed operation is recorded first.
    pub async fn execute_with_fallback<F, Fut, G, GFut, T, E>(
        &self,
        key: &str,
        operation: F,
        fallback: G,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        G: FnOnce() -> GFut,
        GFut: Future<Output = Result<T, E>>,
    {
        match self.execute(key, operation).await {
            Ok(value) => Ok(value),
            Err(CircuitError::Open { .. }) => fallback().await,
            Err(CircuitError::Operation(_)) => {
                debug!(circuit = %key, "Operation failed, using fallback");
                fallback().await
            }
        }
    }

    /// Current persisted state for `key`.
    pub async fn state(&self, key: &str) -> CircuitState {
        self.snapshot(key).await.state
    }

    /// Current persisted snapshot for `key`.
    pub async fn snapshot(&self, key: &str) -> CircuitSnapshot {
        self.load(key).await
    }

    /// Force the circuit for `key` closed.
    pub async fn reset(&self, key: &str) {
        info!(circuit = %key, "Circuit manually reset");
        self.persist(key, CircuitSnapshot::closed()).await;
    }

    async fn admit(&self, key: &str) -> Admission {
        let snapshot = self.load(key).await;

        match snapshot.state {
            CircuitState::Closed => Admission::Allowed { probe: None },
            CircuitState::Open => {
                let wait = self.remaining_cooldown(&snapshot);
                if !wait.is_zero() {
                    return Admission::Rejected { retry_after: wait };
                }

                match self.try_probe(key) {
                    Some(probe) => {
                        info!(circuit = %key, "Circuit half-open, probing");
                        self.persist(
                            key,
                            CircuitSnapshot {
                                state: CircuitState::HalfOpen,
                                ..snapshot
                            },
                        )
                        .await;
                        Admission::Allowed { probe: Some(probe) }
                    }
                    None => self.probe_busy(),
                }
            }
            CircuitState::HalfOpen => match self.try_probe(key) {
                Some(probe) => Admission::Allowed { probe: Some(probe) },
                None => self.probe_busy(),
            },
        }
    }

    fn probe_busy(&self) -> Admission {
        Admission::Rejected {
            retry_after: Duration::from_secs(1),
        }
    }

    fn remaining_cooldown(&self, snapshot: &CircuitSnapshot) -> Duration {
        let since = snapshot.last_failure_ms.unwrap_or(0);
        let elapsed = Duration::from_millis(self.clock.now_millis().saturating_sub(since));
        self.config.recovery_timeout().saturating_sub(elapsed)
    }

    fn try_probe(&self, key: &str) -> Option<ProbeGuard> {
        match self.probes.entry(key.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(());
                Some(ProbeGuard {
                    probes: Arc::clone(&self.probes),
                    key: key.to_string(),
                })
            }
        }
    }

    async fn record_success(&self, key: &str, probe: bool) {
        let current = self.load(key).await;

        if probe {
            info!(circuit = %key, "Probe succeeded, circuit closed");
        } else if current.is_pristine() {
            return;
        } else if current.state == CircuitState::Open {
            // Admitted before another caller tripped the circuit.
            return;
        }

        self.persist(key, CircuitSnapshot::closed()).await;
    }

    async fn record_failure(&self, key: &str, probe: bool) {
        let now = self.clock.now_millis();
        let current = self.load(key).await;
        let failures = current.failures.saturating_add(1);

        let next = if probe || current.state == CircuitState::HalfOpen {
            warn!(circuit = %key, "Probe failed, circuit re-opened");
            CircuitSnapshot::open(failures, now)
        } else if current.state == CircuitState::Open {
            return;
        } else if failures >= self.config.failure_threshold {
            warn!(
                circuit = %key,
                failures,
                threshold = self.config.failure_threshold,
                "Circuit opened"
            );
            CircuitSnapshot::open(failures, now)
        } else {
            debug!(circuit = %key, failures, "Recorded failure");
            CircuitSnapshot {
                failures,
                last_failure_ms: Some(now),
                ..CircuitSnapshot::closed()
            }
        };

        self.persist(key, next).await;
    }

    async fn load(&self, key: &str) -> CircuitSnapshot {
        match self.store.get(&self.store_key(key)).await {
            Ok(Some(raw)) => match CircuitSnapshot::decode(key, &raw) {
                Some(snapshot) => {
                    self.mirror.insert(key.to_string(), snapshot.clone());
                    snapshot
                }
                None => {
                    self.mirror.remove(key);
                    CircuitSnapshot::closed()
                }
            },
            Ok(None) => {
                self.mirror.remove(key);
                CircuitSnapshot::closed()
            }
            Err(err) => {
                warn!(circuit = %key, error = %err, "Circuit state unavailable, using local copy");
                self.mirror
                    .get(key)
                    .map(|snapshot| snapshot.clone())
                    .unwrap_or_default()
            }
        }
    }

    async fn persist(&self, key: &str, snapshot: CircuitSnapshot) {
        let encoded = snapshot.encode();
        self.mirror.insert(key.to_string(), snapshot);

        if let Err(err) = self
            .store
            .set_with_ttl(&self.store_key(key), &encoded, self.config.state_ttl())
            .await
        {
            warn!(circuit = %key, error = %err, "Failed to persist circuit state");
        }
    }

    fn store_key(&self, key: &str) -> String {
        format!("{}:{}", self.config.key_prefix, key)
    }
}
