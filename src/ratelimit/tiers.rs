//! Tier and load based ceiling selection.
//!
//! Everything here is a pure function of static tables and its inputs.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::kind::LimiterKind;
use crate::error::BulwarkError;

/// The lowest fraction of a ceiling that load shedding may leave.
const MIN_LOAD_FACTOR: f64 = 0.1;

/// Caller identity class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallerTier {
    Anonymous,
    #[default]
    Free,
    Premium,
    Pro,
}

impl CallerTier {
    pub fn multiplier(&self) -> f64 {
        match self {
            CallerTier::Anonymous => 0.5,
            CallerTier::Free => 1.0,
            CallerTier::Premium => 5.0,
            CallerTier::Pro => 10.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallerTier::Anonymous => "anonymous",
            CallerTier::Free => "free",
            CallerTier::Premium => "premium",
            CallerTier::Pro => "pro",
        }
    }
}

impl fmt::Display for CallerTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallerTier {
    type Err = BulwarkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            CallerTier::Anonymous,
            CallerTier::Free,
            CallerTier::Premium,
            CallerTier::Pro,
        ]
        .into_iter()
        .find(|tier| tier.as_str().eq_ignore_ascii_case(s))
        .ok_or_else(|| BulwarkError::Config(format!("unknown tier '{}'", s)))
    }
}

/// `max(1, floor(base * tier multiplier))`
pub fn tiered_ceiling(base: u64, tier: CallerTier) -> u64 {
    scale(base, tier.multiplier())
}

/// `max(1, floor(base * max(0.1, 1 - load)))`, with `load` clamped to `[0, 1]`.
pub fn load_adjusted_ceiling(base: u64, load: f64) -> u64 {
    let load = if load.is_nan() { 0.0 } else { load.clamp(0.0, 1.0) };
    scale(base, (1.0 - load).max(MIN_LOAD_FACTOR))
}

fn scale(base: u64, factor: f64) -> u64 {
    ((base as f64 * factor).floor() as u64).max(1)
}

/// Picks the ceiling each limiter should enforce for one caller.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LimitSelector {
    pub tier: CallerTier,
    /// Observed system load in `[0, 1]`, if known.
    pub system_load: Option<f64>,
}

impl LimitSelector {
    pub fn new(tier: CallerTier) -> Self {
        Self {
            tier,
            system_load: None,
        }
    }

    #[must_use]
    pub fn with_load(mut self, load: f64) -> Self {
        self.system_load = Some(load);
        self
    }

    /// The effective ceiling for `kind`.
    ///
    /// Burst protection is never scaled.
    pub fn ceiling(&self, kind: LimiterKind) -> u64 {
        if kind == LimiterKind::Burst {
            return kind.ceiling();
        }

        let tiered = tiered_ceiling(kind.ceiling(), self.tier);
        match self.system_load {
            Some(load) => load_adjusted_ceiling(tiered, load),
            None => tiered,
        }
    }
}
