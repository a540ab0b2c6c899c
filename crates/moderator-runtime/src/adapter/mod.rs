//! Model adapter abstraction for moderator-runtime.
//!
//! The engine only needs one capability from a generative model: turn a
//! prompt into text. Concrete backends implement [`ModelAdapter`]; the
//! engine receives one as `Arc<dyn ModelAdapter>` and never builds it.
//!
//! ## Security
//!
//! Backends that need API keys keep them in `secrecy::SecretString` so they
//! cannot leak through `Debug` or logs.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

mod factory;

#[cfg(feature = "anthropic")]
mod anthropic;

pub use factory::{AdapterFactory, AdapterRegistry};

#[cfg(feature = "anthropic")]
pub use anthropic::{AnthropicAdapter, AnthropicAdapterFactory, ANTHROPIC_API_KEY_ENV};

/// Errors from model adapters.
#[derive(Error, Debug, Clone)]
pub enum ModelError {
    #[error("HTTP request failed: {0}")]
    HttpError(String),

    #[error("Rate limit exceeded, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("API error: {status} - {message}")]
    ApiError { status: u16, message: String },

    #[error("Response parse error: {0}")]
    ParseError(String),

    #[error("Authentication failed")]
    AuthError,

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Adapter not configured: {0}")]
    NotConfigured(String),
}

impl ModelError {
    /// Whether retrying the same call may succeed.
    ///
    /// Timeouts, connection failures, rate limits and 5xx responses are
    /// transient. Everything else fails the same way again.
    pub fn is_transient(&self) -> bool {
        match self {
            ModelError::HttpError(_) | ModelError::RateLimited { .. } | ModelError::Timeout(_) => {
                true
            }
            ModelError::ApiError { status, .. } => *status >= 500,
            ModelError::ParseError(_) | ModelError::AuthError | ModelError::NotConfigured(_) => {
                false
            }
        }
    }
}

/// Text generation capability consumed by the node evaluator.
///
/// Implementations must be safe to call concurrently; the orchestrator
/// issues several calls at once, bounded by its concurrency limit.
#[async_trait]
pub trait ModelAdapter: Send + Sync {
    /// Generate a completion for `prompt`.
    async fn generate(&self, prompt: &str) -> Result<String, ModelError>;

    /// Check if the backend is usable.
    async fn health_check(&self) -> bool {
        true
    }

    /// Adapter name for logs.
    fn name(&self) -> &str;
}
