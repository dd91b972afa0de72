//! Configuration management for Bulwark.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

use crate::error::{BulwarkError, Result};
use crate::loader::{BatchSchedule, LoaderOptions};
use crate::ratelimit::{StoreFailurePolicy, TrustedSources};
use crate::retry::{Backoff, RetryPolicy};

/// Environment variable prefix, e.g. `BULWARK__CIRCUIT_BREAKER__FAILURE_THRESHOLD`.
const ENV_PREFIX: &str = "BULWARK";

/// Main configuration for Bulwark.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulwarkConfig {
    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Circuit breaker configuration
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Batching loader configuration
    #[serde(default)]
    pub loader: LoaderConfig,

    /// Retry configuration for store and batch calls
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Prefix for counter keys in the store
    #[serde(default = "default_rate_limit_prefix")]
    pub key_prefix: String,

    /// Behaviour when the counter store is unreachable
    #[serde(default)]
    pub failure_policy: StoreFailurePolicy,

    /// Identifiers that skip rate limiting
    #[serde(default)]
    pub trusted_identifiers: Vec<String>,

    /// User-agent fragments that skip rate limiting
    #[serde(default)]
    pub trusted_user_agents: Vec<String>,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_rate_limit_prefix(),
            failure_policy: StoreFailurePolicy::default(),
            trusted_identifiers: Vec::new(),
            trusted_user_agents: Vec::new(),
        }
    }
}

impl RateLimitingConfig {
    pub fn trusted_sources(&self) -> TrustedSources {
        TrustedSources {
            identifiers: self.trusted_identifiers.iter().cloned().collect(),
            user_agents: self.trusted_user_agents.clone(),
        }
    }
}

fn default_rate_limit_prefix() -> String {
    "ratelimit".to_string()
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Seconds an open circuit waits before allowing a probe
    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout_secs: u64,

    /// Seconds persisted circuit state lives in the store
    #[serde(default = "default_state_ttl")]
    pub state_ttl_secs: u64,

    /// Prefix for circuit keys in the store
    #[serde(default = "default_circuit_prefix")]
    pub key_prefix: String,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout(),
            state_ttl_secs: default_state_ttl(),
            key_prefix: default_circuit_prefix(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }

    pub fn state_ttl(&self) -> Duration {
        Duration::from_secs(self.state_ttl_secs)
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout() -> u64 {
    60
}

fn default_state_ttl() -> u64 {
    300
}

fn default_circuit_prefix() -> String {
    "circuit".to_string()
}

/// Batching loader configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Largest batch handed to the batch function (unbounded if unset)
    #[serde(default)]
    pub max_batch_size: Option<usize>,

    /// Cache and deduplicate loads by key
    #[serde(default = "default_cache")]
    pub cache: bool,

    /// Wait this long before dispatching instead of the next scheduler tick
    #[serde(default)]
    pub batch_delay_ms: Option<u64>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            max_batch_size: None,
            cache: default_cache(),
            batch_delay_ms: None,
        }
    }
}

impl LoaderConfig {
    pub fn options(&self) -> LoaderOptions {
        LoaderOptions {
            max_batch_size: self.max_batch_size,
            cache: self.cache,
            schedule: match self.batch_delay_ms {
                Some(ms) => BatchSchedule::Delay(Duration::from_millis(ms)),
                None => BatchSchedule::NextTick,
            },
        }
    }
}

fn default_cache() -> bool {
    true
}

/// Retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base delay in milliseconds
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,

    #[serde(default)]
    pub max_delay_ms: Option<u64>,

    #[serde(default)]
    pub backoff: Backoff,

    #[serde(default)]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_ms: default_delay_ms(),
            max_delay_ms: None,
            backoff: Backoff::default(),
            jitter: false,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            delay: Duration::from_millis(self.delay_ms),
            backoff: self.backoff,
            max_delay: self.max_delay_ms.map(Duration::from_millis),
            jitter: self.jitter,
            on_retry: None,
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_delay_ms() -> u64 {
    1000
}

impl BulwarkConfig {
    /// Load configuration from a YAML file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: BulwarkConfig = serde_yaml::from_str(yaml)
            .map_err(|e| BulwarkError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Layer an optional file and `BULWARK__*` environment variables.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            info!(path = %path, "Loading configuration file");
            builder = builder.add_source(::config::File::with_name(path));
        }

        let config: BulwarkConfig = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| BulwarkError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would disable a component by accident.
    pub fn validate(&self) -> Result<()> {
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(BulwarkError::Config(
                "circuit_breaker.failure_threshold must be at least 1".into(),
            ));
        }
        if self.loader.max_batch_size == Some(0) {
            return Err(BulwarkError::Config(
                "loader.max_batch_size must be at least 1".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(BulwarkError::Config(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
