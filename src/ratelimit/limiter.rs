//! Sliding window limiter on top of a counter store.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, trace};

use super::kind::LimiterKind;
use crate::clock::Clock;
use crate::store::{CounterStore, StoreError};

/// The outcome of a single limiter check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LimitDecision {
    /// Which limiter produced this decision
    pub kind: LimiterKind,
    pub allowed: bool,
    /// The ceiling that was enforced
    pub limit: u64,
    pub remaining: u64,
    /// When quota is available again
    pub reset_at: DateTime<Utc>,
}

impl LimitDecision {
    /// A decision that was not backed by the store.
    pub(crate) fn unenforced(
        kind: LimiterKind,
        limit: u64,
        allowed: bool,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            kind,
            allowed,
            limit,
            remaining: if allowed { limit } else { 0 },
            reset_at: now + to_chrono(kind.window()),
        }
    }

    /// Time left until `reset_at`, rounded up to whole seconds.
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> u64 {
        let millis = (self.reset_at - now).num_milliseconds().max(0) as u64;
        millis.div_ceil(1000)
    }
}

/// Sub-buckets per window.
pub const SUB_BUCKETS: u64 = 10;

/// Counts events per `(limiter, identifier)` in a sliding window.
///
/// The window is split into [`SUB_BUCKETS`] fixed sub-buckets. Every
/// sub-bucket that overlaps `[now - window, now]` is counted in full, so a
/// check may over-count by up to one sub-bucket but never lets more than the
/// ceiling through in any span shorter than the window. Every call consumes
/// one unit, whether or not it is allowed.
pub struct SlidingWindowLimiter {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    prefix: String,
}

impl SlidingWindowLimiter {
    pub fn new(store: Arc<dyn CounterStore>, clock: Arc<dyn Clock>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            clock,
            prefix: prefix.into(),
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Record one event for `identifier` under `kind` and decide if it fits
    /// within `ceiling`.
    pub async fn limit(
        &self,
        kind: LimiterKind,
        ceiling: u64,
        identifier: &str,
    ) -> Result<LimitDecision, StoreError> {
        let window_ms = (kind.window().as_millis() as u64).max(SUB_BUCKETS);
        let bucket_ms = window_ms / SUB_BUCKETS;
        let now_ms = self.clock.now_millis();
        let current = now_ms / bucket_ms;
        let earlier: Vec<u64> = (current.saturating_sub(SUB_BUCKETS)..current).collect();

        let current_key = self.bucket_key(kind, identifier, current);
        trace!(key = %current_key, ceiling, "Checking sliding window");

        // Long enough for the bucket to stay readable until it leaves the window.
        let ttl = Duration::from_millis(window_ms + 2 * bucket_ms);
        let current_count = self.store.increment(&current_key, ttl).await?;

        let keys: Vec<String> = earlier
            .iter()
            .map(|bucket| self.bucket_key(kind, identifier, *bucket))
            .collect();
        let raw = if keys.is_empty() {
            Vec::new()
        } else {
            self.store.get_many(&keys).await?
        };

        // Oldest first, current last.
        let mut counts: Vec<(u64, u64)> = earlier
            .into_iter()
            .zip(raw.into_iter().chain(std::iter::repeat(None)))
            .map(|(bucket, value)| {
                let count = value.and_then(|v| v.parse::<u64>().ok()).unwrap_or(0);
                (bucket, count)
            })
            .collect();
        counts.push((current, current_count));

        let total: u64 = counts.iter().map(|(_, count)| count).sum();
        let allowed = total <= ceiling;

        let release = releasing_bucket(&counts, total, ceiling, allowed);
        let reset_ms = (release + SUB_BUCKETS + 1).saturating_mul(bucket_ms);
        let reset_at = DateTime::from_timestamp_millis(reset_ms as i64)
            .unwrap_or_else(|| self.clock.now());

        let decision = LimitDecision {
            kind,
            allowed,
            limit: ceiling,
            remaining: ceiling.saturating_sub(total),
            reset_at,
        };

        if !allowed {
            debug!(
                limiter = %kind,
                identifier = %identifier,
                count = total,
                ceiling,
                "Rate limit exceeded"
            );
        }

        Ok(decision)
    }

    fn bucket_key(&self, kind: LimiterKind, identifier: &str, bucket: u64) -> String {
        format!("{}:{}:{}:{}", self.prefix, kind, identifier, bucket)
    }
}

/// The sub-bucket whose departure from the window frees quota.
///
/// When allowed that is the oldest non-empty bucket. When rejected it is the
/// bucket after which the count drops below the ceiling, so one more call
/// fits. A bucket `i` stops being counted at `(i + SUB_BUCKETS + 1) * bucket_ms`.
fn releasing_bucket(counts: &[(u64, u64)], total: u64, ceiling: u64, allowed: bool) -> u64 {
    let target = if allowed { total } else { ceiling };
    let mut left = total;
    for (bucket, count) in counts {
        left = left.saturating_sub(*count);
        if left < target {
            return *bucket;
        }
    }
    counts.last().map(|(bucket, _)| *bucket).unwrap_or(0)
}

pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}
