use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};

use futures::future::{self, BoxFuture, FutureExt, JoinAll, Shared};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use super::options::{BatchSchedule, LoaderOptions};

/// What a batch function returns: one result per key, in key order, or a
/// single error for the whole batch.
pub type BatchResult<V, E> = Result<Vec<Result<V, E>>, E>;

/// A pending load. Cloning it shares the same underlying request.
pub type Load<V, E> = Shared<BoxFuture<'static, Result<V, LoadError<E>>>>;

type BatchFn<K, V, E> = Arc<dyn Fn(Vec<K>) -> BoxFuture<'static, BatchResult<V, E>> + Send + Sync>;
type CacheKeyFn<K> = Arc<dyn Fn(&K) -> String + Send + Sync>;

/// Why a single load did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError<E> {
    /// The batch function failed as a whole.
    #[error("batch load failed: {0}")]
    Batch(E),

    /// The batch function returned an error for this key only.
    #[error("{0}")]
    Item(E),

    #[error("batch function returned {actual} values for {expected} keys")]
    LengthMismatch { expected: usize, actual: usize },

    /// The dispatch task went away before answering.
    #[error("load abandoned before completion")]
    Dropped,
}

impl<E> LoadError<E> {
    /// The error produced by the batch function, if any.
    pub fn source_error(&self) -> Option<&E> {
        match self {
            Self::Batch(err) | Self::Item(err) => Some(err),
            _ => None,
        }
    }
}

struct Queued<K, V, E> {
    key: K,
    /// Cache key and generation of the entry this load created, if cached
    cache_tag: Option<(String, u64)>,
    tx: oneshot::Sender<Result<V, LoadError<E>>>,
}

struct CacheEntry<V, E> {
    generation: u64,
    load: Load<V, E>,
}

struct State<K, V, E> {
    queue: Vec<Queued<K, V, E>>,
    dispatch_scheduled: bool,
    cache: HashMap<String, CacheEntry<V, E>>,
    next_generation: u64,
}

struct Inner<K, V, E> {
    batch_fn: BatchFn<K, V, E>,
    cache_key_fn: CacheKeyFn<K>,
    options: LoaderOptions,
    state: Mutex<State<K, V, E>>,
}

/// Coalesces single-key loads into batch calls.
///
/// Dispatch is scheduled when a queued load is first awaited, and every
/// `load` issued before the batch is handed to the batch function joins it.
/// Loads created back to back and then awaited together land in one batch on
/// either runtime flavour. With caching enabled, repeated loads of one key share a single
/// request and its eventual result. A batch-wide failure is delivered to
/// every key in the batch and evicted from the cache so the next load
/// retries; per-key errors stay cached like values.
///
/// The loader is a cheap handle and can be cloned freely. Loads must be
/// awaited from within a Tokio runtime.
pub struct BatchLoader<K, V, E> {
    inner: Arc<Inner<K, V, E>>,
}

impl<K, V, E> Clone for BatchLoader<K, V, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V, E> fmt::Debug for BatchLoader<K, V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("BatchLoader")
            .field("options", &self.inner.options)
            .field("queued", &state.queue.len())
            .field("cached", &state.cache.len())
            .finish()
    }
}

impl<K, V, E> BatchLoader<K, V, E>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Create a loader with default options, caching by the key's
    /// `Display` form.
    pub fn new<F, Fut>(batch_fn: F) -> Self
    where
        K: fmt::Display,
        F: Fn(Vec<K>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = BatchResult<V, E>> + Send + 'static,
    {
        Self::with_options(batch_fn, LoaderOptions::default())
    }

    pub fn with_options<F, Fut>(batch_fn: F, options: LoaderOptions) -> Self
    where
        K: fmt::Display,
        F: Fn(Vec<K>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = BatchResult<V, E>> + Send + 'static,
    {
        Self::with_cache_key(batch_fn, |key: &K| key.to_string(), options)
    }

    /// Create a loader with a custom cache key function. Keys that map to
    /// the same cache key are deduplicated.
    pub fn with_cache_key<F, Fut, C>(batch_fn: F, cache_key: C, options: LoaderOptions) -> Self
    where
        F: Fn(Vec<K>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = BatchResult<V, E>> + Send + 'static,
        C: Fn(&K) -> String + Send + Sync + 'static,
    {
        let batch_fn: BatchFn<K, V, E> = Arc::new(move |keys| batch_fn(keys).boxed());
        Self {
            inner: Arc::new(Inner {
                batch_fn,
                cache_key_fn: Arc::new(cache_key),
                options,
                state: Mutex::new(State {
                    queue: Vec::new(),
                    dispatch_scheduled: false,
                    cache: HashMap::new(),
                    next_generation: 0,
                }),
            }),
        }
    }

    pub fn options(&self) -> &LoaderOptions {
        &self.inner.options
    }

    /// Request one key.
    ///
    /// The key is queued immediately. The first poll of the returned future
    /// schedules the batch if none is pending.
    pub fn load(&self, key: K) -> Load<V, E> {
        let inner = &self.inner;
        let cache_key = inner.options.cache.then(|| (inner.cache_key_fn)(&key));

        let mut state = inner.state.lock();
        if let Some(entry) = cache_key.as_ref().and_then(|ck| state.cache.get(ck)) {
            trace!(cache_key = ?cache_key, "Loader cache hit");
            return entry.load.clone();
        }

        let (tx, rx) = oneshot::channel();
        // Weak, since the cache holds this future.
        let trigger = Arc::downgrade(inner);
        let load: Load<V, E> = async move {
            if let Some(inner) = trigger.upgrade() {
                ensure_dispatch(&inner);
            }
            rx.await.unwrap_or(Err(LoadError::Dropped))
        }
        .boxed()
        .shared();

        let cache_tag = match cache_key {
            Some(ck) => {
                let generation = state.next_generation;
                state.next_generation += 1;
                state.cache.insert(
                    ck.clone(),
                    CacheEntry {
                        generation,
                        load: load.clone(),
                    },
                );
                Some((ck, generation))
            }
            None => None,
        };

        state.queue.push(Queued { key, cache_tag, tx });
        load
    }

    /// Request several keys at once. Results come back in key order and
    /// fail independently.
    pub fn load_many<I>(&self, keys: I) -> JoinAll<Load<V, E>>
    where
        I: IntoIterator<Item = K>,
    {
        future::join_all(keys.into_iter().map(|key| self.load(key)))
    }

    /// Seed the cache with a known value. An existing entry is kept.
    ///
    /// Returns whether the value was stored.
    pub fn prime(&self, key: &K, value: V) -> bool {
        if !self.inner.options.cache {
            return false;
        }
        let cache_key = (self.inner.cache_key_fn)(key);
        let mut state = self.inner.state.lock();
        if state.cache.contains_key(&cache_key) {
            return false;
        }
        let generation = state.next_generation;
        state.next_generation += 1;
        state.cache.insert(
            cache_key,
            CacheEntry {
                generation,
                load: future::ready(Ok(value)).boxed().shared(),
            },
        );
        true
    }

    /// Forget one key so the next load fetches it again.
    pub fn clear(&self, key: &K) {
        let cache_key = (self.inner.cache_key_fn)(key);
        self.inner.state.lock().cache.remove(&cache_key);
    }

    pub fn clear_all(&self) {
        self.inner.state.lock().cache.clear();
    }

    /// Number of cached keys, pending or resolved.
    pub fn cached_len(&self) -> usize {
        self.inner.state.lock().cache.len()
    }
}

/// Schedule a dispatch unless one is already pending or nothing is queued.
fn ensure_dispatch<K, V, E>(inner: &Arc<Inner<K, V, E>>)
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    {
        let mut state = inner.state.lock();
        if state.queue.is_empty() || state.dispatch_scheduled {
            return;
        }
        state.dispatch_scheduled = true;
    }
    schedule(Arc::clone(inner));
}

fn schedule<K, V, E>(inner: Arc<Inner<K, V, E>>)
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    tokio::spawn(async move {
        match inner.options.schedule {
            BatchSchedule::NextTick => tokio::task::yield_now().await,
            BatchSchedule::Delay(delay) => tokio::time::sleep(delay).await,
        }
        dispatch(inner).await;
    });
}

async fn dispatch<K, V, E>(inner: Arc<Inner<K, V, E>>)
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    let batch: Vec<Queued<K, V, E>> = {
        let mut state = inner.state.lock();
        let take = match inner.options.max_batch_size {
            Some(max) => max.max(1).min(state.queue.len()),
            None => state.queue.len(),
        };
        let batch = state.queue.drain(..take).collect();
        if state.queue.is_empty() {
            state.dispatch_scheduled = false;
        } else {
            // Leftovers beyond the batch cap go out on the next round.
            schedule(Arc::clone(&inner));
        }
        batch
    };

    if batch.is_empty() {
        return;
    }

    let keys: Vec<K> = batch.iter().map(|queued| queued.key.clone()).collect();
    debug!(size = keys.len(), "Dispatching batch");

    match (inner.batch_fn)(keys).await {
        Ok(values) if values.len() == batch.len() => {
            for (queued, value) in batch.into_iter().zip(values) {
                let _ = queued.tx.send(value.map_err(LoadError::Item));
            }
        }
        Ok(values) => {
            warn!(
                expected = batch.len(),
                actual = values.len(),
                "Batch function returned the wrong number of values"
            );
            let err = LoadError::LengthMismatch {
                expected: batch.len(),
                actual: values.len(),
            };
            fail_batch(&inner, batch, err);
        }
        Err(err) => {
            warn!(size = batch.len(), "Batch function failed");
            fail_batch(&inner, batch, LoadError::Batch(err));
        }
    }
}

/// Deliver one error to every load in the batch and evict their cache
/// entries, unless a newer entry already replaced them.
fn fail_batch<K, V, E: Clone>(inner: &Inner<K, V, E>, batch: Vec<Queued<K, V, E>>, err: LoadError<E>) {
    {
        let mut state = inner.state.lock();
        for queued in &batch {
            if let Some((cache_key, generation)) = &queued.cache_tag {
                let current = state
                    .cache
                    .get(cache_key)
                    .is_some_and(|entry| entry.generation == *generation);
                if current {
                    state.cache.remove(cache_key);
                }
            }
        }
    }

    for queued in batch {
        let _ = queued.tx.send(Err(err.clone()));
    }
}
