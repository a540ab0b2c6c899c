//! Resilience patterns for adapter calls.
//!
//! - Circuit breaker so a failing backend stops being called
//! - Retry with exponential backoff for transient failures, never sooner
//!   than a rate limit's `Retry-After`

mod circuit_breaker;
mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub(crate) use retry::honor_retry_after;
pub use retry::RetryConfig;
