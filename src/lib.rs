//! Bulwark - request shaping and resilience primitives
//!
//! This crate puts a layered sliding-window rate limiter, a per-key circuit
//! breaker and a batching entity loader in front of backend calls. Shared
//! state (window counters and circuit snapshots) lives behind the
//! [`store::CounterStore`] trait so several processes can cooperate through
//! one store.

pub mod circuit;
pub mod clock;
pub mod config;
pub mod error;
pub mod gatekeeper;
pub mod loader;
pub mod ratelimit;
pub mod retry;
pub mod store;
