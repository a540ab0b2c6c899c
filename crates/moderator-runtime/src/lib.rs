//! # moderator-runtime
//!
//! Async half of the comment moderation engine.
//!
//! `moderator-core` defines rubrics and aggregates scores without ever
//! calling a model. This crate does the calling: it renders one judge
//! prompt per rubric leaf, sends it through an injected [`ModelAdapter`],
//! validates the reply, and joins all leaves under a single deadline.
//!
//! Failures never abort an evaluation. Transient adapter errors are
//! retried with backoff; anything that still fails becomes an uncertain
//! sentinel, which forces `NEEDS_REVIEW`.
//!
//! ## Example
//!
//! ```rust,ignore
//! use moderator_runtime::{EngineConfig, ModerationEngine};
//!
//! let engine = ModerationEngine::new(adapter, EngineConfig::default())?;
//! let tree = engine.load_rubric(&rubric_yaml, &lore).await?;
//!
//! let result = engine.evaluate_comment("Nice photo!", None, tree).await;
//! println!("{}", serde_json::to_string(&result.payload())?);
//! ```

pub mod adapter;
pub mod cache;
pub mod config;
pub mod evaluator;
pub mod orchestrator;
pub mod prompts;
pub mod resilience;
pub mod response;

pub use adapter::{AdapterFactory, AdapterRegistry, ModelAdapter, ModelError};
#[cfg(feature = "anthropic")]
pub use adapter::{AnthropicAdapter, AnthropicAdapterFactory, ANTHROPIC_API_KEY_ENV};
pub use cache::RubricCache;
pub use config::{CacheConfig, ConfigError, EngineConfig};
pub use evaluator::{CallPolicy, NodeEvaluator};
pub use orchestrator::{EngineError, ModerationEngine, ModerationEngineBuilder};
pub use resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitState, RetryConfig};
pub use response::{parse_judgement, Judgement, PayloadError};
