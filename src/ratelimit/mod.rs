//! Rate limiting: named sliding-window limiters, tier selection and the
//! burst/endpoint/global chain.

mod bypass;
mod guard;
mod kind;
mod limiter;
mod request;
mod tiers;

pub use bypass::TrustedSources;
pub use guard::{
    RateLimitGuard, RateLimitOutcome, StoreFailurePolicy, HEADER_LIMIT, HEADER_REMAINING,
    HEADER_RESET, HEADER_RETRY_AFTER, HEADER_TYPE,
};
pub use kind::LimiterKind;
pub use limiter::{LimitDecision, SlidingWindowLimiter};
pub use request::RateLimitRequest;
pub use tiers::{load_adjusted_ceiling, tiered_ceiling, CallerTier, LimitSelector};
