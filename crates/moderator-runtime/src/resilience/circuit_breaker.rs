//! Circuit breaker around the model adapter.
//!
//! After repeated transport failures the circuit opens and leaves resolve
//! to uncertain sentinels without calling the adapter. Once the recovery
//! timeout passes, trial calls are let through (half-open) and enough
//! successes close the circuit again.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::config::duration_str;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening
    pub failure_threshold: u32,

    /// Time spent open before trial calls are allowed
    #[serde(with = "duration_str")]
    pub recovery_timeout: Duration,

    /// Successes in half-open needed to close
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            success_threshold: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed { failures: u32 },
    Open { opened_at: Instant },
    HalfOpen { successes: u32 },
}

impl CircuitState {
    pub fn is_open(&self) -> bool {
        matches!(self, CircuitState::Open { .. })
    }
}

pub struct CircuitBreaker {
    state: Mutex<CircuitState>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: Mutex::new(CircuitState::Closed { failures: 0 }),
            config,
        }
    }

    /// Whether a call may go to the adapter now.
    ///
    /// Moves an expired open circuit to half-open.
    pub fn allow_request(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            CircuitState::Open { opened_at } => {
                if opened_at.elapsed() >= self.config.recovery_timeout {
                    *state = CircuitState::HalfOpen { successes: 0 };
                    tracing::info!("Circuit half-open, allowing trial calls");
                    true
                } else {
                    false
                }
            }
            CircuitState::Closed { .. } | CircuitState::HalfOpen { .. } => true,
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock();
        match *state {
            CircuitState::HalfOpen { successes } => {
                if successes + 1 >= self.config.success_threshold {
                    *state = CircuitState::Closed { failures: 0 };
                    tracing::info!("Circuit closed after successful recovery");
                } else {
                    *state = CircuitState::HalfOpen {
                        successes: successes + 1,
                    };
                }
            }
            CircuitState::Closed { .. } => {
                *state = CircuitState::Closed { failures: 0 };
            }
            CircuitState::Open { .. } => {}
        }
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        match *state {
            CircuitState::Closed { failures } => {
                if failures + 1 >= self.config.failure_threshold {
                    *state = CircuitState::Open {
                        opened_at: Instant::now(),
                    };
                    tracing::warn!(
                        failures = failures + 1,
                        "Circuit opened after repeated failures"
                    );
                } else {
                    *state = CircuitState::Closed {
                        failures: failures + 1,
                    };
                }
            }
            CircuitState::HalfOpen { .. } => {
                *state = CircuitState::Open {
                    opened_at: Instant::now(),
                };
                tracing::warn!("Circuit reopened after failed recovery attempt");
            }
            CircuitState::Open { .. } => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        *self.state.lock()
    }

    pub fn reset(&self) {
        *self.state.lock() = CircuitState::Closed { failures: 0 };
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("state", &self.state())
            .field("config", &self.config)
            .finish()
    }
}
