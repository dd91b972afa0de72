//! Named limiters and their static parameters.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::BulwarkError;

/// A named limiter.
///
/// Each kind carries a fixed ceiling and window. Burst and global are applied
/// to every request; the rest are endpoint-specific.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimiterKind {
    /// Short spike protection: 10 events per 10 seconds
    Burst,
    /// General API traffic: 500 events per hour
    Api,
    /// Search endpoints: 60 events per minute
    Search,
    /// Sign-in and token endpoints: 5 events per 15 minutes
    Auth,
    /// Mutating endpoints: 100 events per hour
    Write,
    /// Per-identifier ceiling across every endpoint: 1000 events per hour
    Global,
}

impl LimiterKind {
    /// Kinds that can be selected as the endpoint-specific limiter.
    pub const ENDPOINTS: [LimiterKind; 4] = [
        LimiterKind::Api,
        LimiterKind::Search,
        LimiterKind::Auth,
        LimiterKind::Write,
    ];

    /// Every kind, in check order where it applies.
    pub const ALL: [LimiterKind; 6] = [
        LimiterKind::Burst,
        LimiterKind::Api,
        LimiterKind::Search,
        LimiterKind::Auth,
        LimiterKind::Write,
        LimiterKind::Global,
    ];

    /// Base number of events allowed per window.
    pub fn ceiling(&self) -> u64 {
        match self {
            LimiterKind::Burst => 10,
            LimiterKind::Api => 500,
            LimiterKind::Search => 60,
            LimiterKind::Auth => 5,
            LimiterKind::Write => 100,
            LimiterKind::Global => 1000,
        }
    }

    /// Length of the window.
    pub fn window(&self) -> Duration {
        match self {
            LimiterKind::Burst => Duration::from_secs(10),
            LimiterKind::Api => Duration::from_secs(3600),
            LimiterKind::Search => Duration::from_secs(60),
            LimiterKind::Auth => Duration::from_secs(15 * 60),
            LimiterKind::Write => Duration::from_secs(3600),
            LimiterKind::Global => Duration::from_secs(3600),
        }
    }

    /// Name used in store keys and the `X-RateLimit-Type` header.
    pub fn as_str(&self) -> &'static str {
        match self {
            LimiterKind::Burst => "burst",
            LimiterKind::Api => "api",
            LimiterKind::Search => "search",
            LimiterKind::Auth => "auth",
            LimiterKind::Write => "write",
            LimiterKind::Global => "global",
        }
    }

    pub fn is_endpoint(&self) -> bool {
        Self::ENDPOINTS.contains(self)
    }
}

impl fmt::Display for LimiterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LimiterKind {
    type Err = BulwarkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| BulwarkError::Config(format!("unknown limiter '{}'", s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_parameters() {
        assert_eq!(LimiterKind::Burst.ceiling(), 10);
        assert_eq!(LimiterKind::Burst.window(), Duration::from_secs(10));
        assert_eq!(LimiterKind::Api.ceiling(), 500);
        assert_eq!(LimiterKind::Api.window(), Duration::from_secs(3600));
    }

    #[test]
    fn test_endpoint_kinds() {
        assert!(LimiterKind::Search.is_endpoint());
        assert!(!LimiterKind::Burst.is_endpoint());
        assert!(!LimiterKind::Global.is_endpoint());
    }

    #[test]
    fn test_parse_round_trips_names() {
        for kind in LimiterKind::ALL {
            assert_eq!(kind.as_str().parse::<LimiterKind>().unwrap(), kind);
        }
        assert_eq!("SEARCH".parse::<LimiterKind>().unwrap(), LimiterKind::Search);
        assert!("upload".parse::<LimiterKind>().is_err());
    }
}
