//! Circuit breaking for operations behind the guard.

mod breaker;
mod state;

pub use breaker::{CircuitBreaker, CircuitError};
pub use state::{CircuitSnapshot, CircuitState, SNAPSHOT_VERSION};
