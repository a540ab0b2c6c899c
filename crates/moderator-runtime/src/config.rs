//! Engine configuration.
//!
//! Loaded from YAML; every field has a default so an empty document is a
//! valid configuration. Durations use humantime syntax (`"30s"`, `"250ms"`).
//!
//! ```yaml
//! concurrency: 4
//! deadline: 30s
//! call_timeout: 15s
//! retry:
//!   max_retries: 2
//!   min_backoff: 200ms
//!   max_backoff: 2s
//! thresholds:
//!   reject_max: 0.3
//!   approve_min: 0.7
//! circuit_breaker:
//!   failure_threshold: 5
//!   recovery_timeout: 30s
//! cache:
//!   max_rubrics: 64
//!   ttl: 1h
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use moderator_core::{DecisionPolicy, PolicyError};

use crate::resilience::{CircuitBreakerConfig, RetryConfig};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Invalid thresholds: {0}")]
    Policy(#[from] PolicyError),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Knobs for one [`ModerationEngine`](crate::ModerationEngine).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Maximum adapter calls in flight per evaluation
    pub concurrency: usize,

    /// Wall-clock budget for a whole evaluation
    #[serde(with = "duration_str")]
    pub deadline: Duration,

    /// Budget for a single adapter call
    #[serde(with = "duration_str")]
    pub call_timeout: Duration,

    pub retry: RetryConfig,

    pub thresholds: DecisionPolicy,

    pub circuit_breaker: CircuitBreakerConfig,

    pub cache: CacheConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            deadline: Duration::from_secs(30),
            call_timeout: Duration::from_secs(15),
            retry: RetryConfig::default(),
            thresholds: DecisionPolicy::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

/// Rubric cache sizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    pub max_rubrics: u64,

    #[serde(with = "duration_str")]
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_rubrics: 64,
            ttl: Duration::from_secs(3600),
        }
    }
}

impl EngineConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        // An empty document deserializes to unit, not a map
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if self.deadline.is_zero() {
            return Err(ConfigError::Invalid("deadline must be positive".to_string()));
        }
        if self.call_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "call_timeout must be positive".to_string(),
            ));
        }
        if self.retry.min_backoff > self.retry.max_backoff {
            return Err(ConfigError::Invalid(format!(
                "retry.min_backoff ({:?}) exceeds retry.max_backoff ({:?})",
                self.retry.min_backoff, self.retry.max_backoff
            )));
        }
        if self.circuit_breaker.failure_threshold == 0 || self.circuit_breaker.success_threshold == 0
        {
            return Err(ConfigError::Invalid(
                "circuit_breaker thresholds must be at least 1".to_string(),
            ));
        }
        if self.cache.max_rubrics == 0 {
            return Err(ConfigError::Invalid(
                "cache.max_rubrics must be at least 1".to_string(),
            ));
        }
        self.thresholds.validate()?;
        Ok(())
    }
}

/// Serde adapter for humantime duration strings.
pub(crate) mod duration_str {
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(de::Error::custom)
    }
}
