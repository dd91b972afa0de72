//! Inbound request description used by the limiter chain.

use serde::{Deserialize, Serialize};

use super::kind::LimiterKind;
use super::tiers::{CallerTier, LimitSelector};

/// What the limiter chain needs to know about a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitRequest {
    /// Stable caller identifier (user id, API key, client address)
    pub identifier: String,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub tier: CallerTier,
    /// Endpoint-specific limiter
    pub endpoint: LimiterKind,
    /// Observed system load in `[0, 1]`
    #[serde(default)]
    pub system_load: Option<f64>,
}

impl RateLimitRequest {
    pub fn new(identifier: impl Into<String>, endpoint: LimiterKind) -> Self {
        Self {
            identifier: identifier.into(),
            user_agent: None,
            tier: CallerTier::default(),
            endpoint,
            system_load: None,
        }
    }

    #[must_use]
    pub fn with_tier(mut self, tier: CallerTier) -> Self {
        self.tier = tier;
        self
    }

    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    #[must_use]
    pub fn with_system_load(mut self, load: f64) -> Self {
        self.system_load = Some(load);
        self
    }

    pub fn selector(&self) -> LimitSelector {
        LimitSelector {
            tier: self.tier,
            system_load: self.system_load,
        }
    }

    /// The limiters to check, in order: burst, endpoint, global.
    ///
    /// An endpoint of `Burst` or `Global` is not checked twice.
    pub fn chain(&self) -> Vec<LimiterKind> {
        let mut chain = vec![LimiterKind::Burst];
        if self.endpoint.is_endpoint() {
            chain.push(self.endpoint);
        }
        chain.push(LimiterKind::Global);
        chain
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_order() {
        let request = RateLimitRequest::new("u", LimiterKind::Search);
        assert_eq!(
            request.chain(),
            vec![LimiterKind::Burst, LimiterKind::Search, LimiterKind::Global]
        );
    }

    #[test]
    fn test_chain_skips_duplicate_kinds() {
        let request = RateLimitRequest::new("u", LimiterKind::Global);
        assert_eq!(request.chain(), vec![LimiterKind::Burst, LimiterKind::Global]);
    }

    #[test]
    fn test_selector_carries_tier_and_load() {
        let request = RateLimitRequest::new("u", LimiterKind::Api)
            .with_tier(CallerTier::Pro)
            .with_system_load(0.3);
        let selector = request.selector();
        assert_eq!(selector.tier, CallerTier::Pro);
        assert_eq!(selector.system_load, Some(0.3));
    }
}
