//! Batched, deduplicating entity loader.
//!
//! Single-key loads issued in the same scheduling tick are coalesced into
//! one call to a caller-supplied batch function. Results are cached per key,
//! so concurrent loads of the same key share one in-flight request.

mod batch;
mod options;

pub use batch::{BatchLoader, BatchResult, Load, LoadError};
pub use options::{BatchSchedule, LoaderOptions};
