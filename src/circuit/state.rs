//! Circuit state and its persisted form.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Schema version written into every persisted snapshot.
pub const SNAPSHOT_VERSION: u32 = 1;

/// The three breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Calls pass through
    #[default]
    Closed,
    /// Calls fail fast
    Open,
    /// One probe call decides between closed and open
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Breaker state for one operation key, as stored in the shared store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub version: u32,
    pub state: CircuitState,
    pub failures: u32,
    /// Epoch milliseconds of the most recent failure
    pub last_failure_ms: Option<u64>,
}

impl Default for CircuitSnapshot {
    fn default() -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            state: CircuitState::Closed,
            failures: 0,
            last_failure_ms: None,
        }
    }
}

impl CircuitSnapshot {
    pub fn closed() -> Self {
        Self::default()
    }

    pub fn open(failures: u32, at_ms: u64) -> Self {
        Self {
            state: CircuitState::Open,
            failures,
            last_failure_ms: Some(at_ms),
            ..Self::default()
        }
    }

    /// Whether this snapshot carries anything worth persisting.
    pub fn is_pristine(&self) -> bool {
        self.state == CircuitState::Closed && self.failures == 0
    }

    pub fn encode(&self) -> String {
        // A struct of plain fields always serializes.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Decode a stored snapshot.
    ///
    /// Unreadable payloads and other schema versions are discarded.
    pub fn decode(key: &str, raw: &str) -> Option<Self> {
        match serde_json::from_str::<CircuitSnapshot>(raw) {
            Ok(snapshot) if snapshot.version == SNAPSHOT_VERSION => Some(snapshot),
            Ok(snapshot) => {
                warn!(
                    key = %key,
                    version = snapshot.version,
                    expected = SNAPSHOT_VERSION,
                    "Discarding circuit snapshot with unknown schema version"
                );
                None
            }
            Err(err) => {
                warn!(key = %key, error = %err, "Discarding unreadable circuit snapshot");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_wire_format() {
        let snapshot = CircuitSnapshot::open(5, 1_000);
        let encoded = snapshot.encode();
        assert!(encoded.contains("\"state\":\"OPEN\""));
        assert!(encoded.contains("\"version\":1"));
        assert_eq!(CircuitSnapshot::decode("k", &encoded), Some(snapshot));
    }

    #[test]
    fn test_half_open_name() {
        let encoded = serde_json::to_string(&CircuitState::HalfOpen).unwrap();
        assert_eq!(encoded, "\"HALF_OPEN\"");
    }

    #[test]
    fn test_decode_rejects_other_versions() {
        let raw = r#"{"version":2,"state":"OPEN","failures":3,"last_failure_ms":5}"#;
        assert_eq!(CircuitSnapshot::decode("k", raw), None);
    }

    #[test]
    fn test_decode_rejects_legacy_blobs() {
        let raw = r#"{"state":"OPEN","failures":3,"lastFailureTime":5}"#;
        assert_eq!(CircuitSnapshot::decode("k", raw), None);
        assert_eq!(CircuitSnapshot::decode("k", "garbage"), None);
    }

    #[test]
    fn test_pristine() {
        assert!(CircuitSnapshot::closed().is_pristine());
        assert!(!CircuitSnapshot::open(1, 0).is_pristine());
    }
}
