use backon::ExponentialBuilder;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::adapter::ModelError;
use crate::config::duration_str;

/// Retry policy for transient adapter failures.
///
/// `max_retries` counts retries, so a leaf makes at most
/// `max_retries + 1` adapter calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub max_retries: usize,

    #[serde(with = "duration_str")]
    pub min_backoff: Duration,

    #[serde(with = "duration_str")]
    pub max_backoff: Duration,

    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            min_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(2),
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn backoff(&self) -> ExponentialBuilder {
        let builder = ExponentialBuilder::default()
            .with_min_delay(self.min_backoff)
            .with_max_delay(self.max_backoff)
            .with_max_times(self.max_retries);
        if self.jitter {
            builder.with_jitter()
        } else {
            builder
        }
    }

    /// Upper bound on adapter calls per leaf.
    pub fn max_attempts(&self) -> usize {
        self.max_retries + 1
    }
}

/// Next backoff delay, raised to the server's `Retry-After` when one was
/// sent. `None` (retries exhausted) stays `None`.
pub(crate) fn honor_retry_after(err: &ModelError, delay: Option<Duration>) -> Option<Duration> {
    match (err, delay) {
        (
            ModelError::RateLimited {
                retry_after: Some(wait),
            },
            Some(delay),
        ) => Some(delay.max(*wait)),
        _ => delay,
    }
}
