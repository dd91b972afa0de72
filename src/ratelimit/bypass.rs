//! Trusted-source allow-list.
//!
//! Trusted identifiers and user agents skip rate limiting entirely. The
//! check runs before any limiter touches the store.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Identifiers and user agents that are never rate limited.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrustedSources {
    /// Exact identifier matches
    #[serde(default)]
    pub identifiers: HashSet<String>,
    /// Case-insensitive substrings of the user agent
    #[serde(default)]
    pub user_agents: Vec<String>,
}

impl TrustedSources {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifiers.insert(identifier.into());
        self
    }

    #[must_use]
    pub fn with_user_agent(mut self, fragment: impl Into<String>) -> Self {
        self.user_agents.push(fragment.into());
        self
    }

    /// Whether a request from `identifier` with `user_agent` is trusted.
    pub fn is_trusted(&self, identifier: &str, user_agent: Option<&str>) -> bool {
        if self.identifiers.contains(identifier) {
            return true;
        }

        let Some(user_agent) = user_agent else {
            return false;
        };
        let user_agent = user_agent.to_ascii_lowercase();
        self.user_agents
            .iter()
            .filter(|fragment| !fragment.is_empty())
            .any(|fragment| user_agent.contains(&fragment.to_ascii_lowercase()))
    }

    pub fn is_empty(&self) -> bool {
        self.identifiers.is_empty() && self.user_agents.is_empty()
    }
}
