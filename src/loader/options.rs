//! Loader tuning knobs.

use std::time::Duration;

/// When a queued batch is handed to the batch function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchSchedule {
    /// Once the first queued load is awaited, after one more scheduler
    /// turn. Loads issued before that point land in the same batch.
    #[default]
    NextTick,
    /// After a fixed delay, trading latency for larger batches.
    Delay(Duration),
}

/// Options for a [`BatchLoader`](super::BatchLoader).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderOptions {
    /// Largest number of keys per batch call. `None` means unbounded.
    pub max_batch_size: Option<usize>,
    /// Cache loads by key. Disabling this also disables deduplication.
    pub cache: bool,
    pub schedule: BatchSchedule,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            max_batch_size: None,
            cache: true,
            schedule: BatchSchedule::NextTick,
        }
    }
}

impl LoaderOptions {
    #[must_use]
    pub fn with_max_batch_size(mut self, max: usize) -> Self {
        self.max_batch_size = Some(max.max(1));
        self
    }

    #[must_use]
    pub fn without_cache(mut self) -> Self {
        self.cache = false;
        self
    }

    #[must_use]
    pub fn with_schedule(mut self, schedule: BatchSchedule) -> Self {
        self.schedule = schedule;
        self
    }
}
