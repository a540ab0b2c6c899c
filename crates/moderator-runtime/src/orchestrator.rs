//! Moderation engine: fans a comment out to every rubric leaf, joins the
//! results and hands them to the deterministic aggregator.
//!
//! - Fan-out: one evaluator future per Task leaf in a `FuturesUnordered`
//! - Bounded: a per-evaluation semaphore caps in-flight adapter calls
//! - Deadline: one `timeout_at` covers the whole evaluation; leaves still
//!   pending when it fires are dropped and recorded as cancelled
//! - Fan-in: results land in tree-order slots, then the aggregator runs

use std::path::Path;
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::Instrument;

use moderator_core::{
    AggregateResult, Aggregator, EvaluationContext, RubricError, RubricTree, SubScoreResult,
    UncertainReason,
};

use crate::adapter::ModelAdapter;
use crate::cache::{short, RubricCache};
use crate::config::{ConfigError, EngineConfig};
use crate::evaluator::{CallPolicy, NodeEvaluator};
use crate::resilience::{CircuitBreaker, CircuitState};

/// Errors surfaced by the engine. Evaluation itself never fails once a
/// tree is loaded and the settings are valid.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Adapter not configured: {0}")]
    NotConfigured(String),

    #[error(transparent)]
    Rubric(#[from] RubricError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Rubric-driven comment moderation.
///
/// Owns the injected adapter (through its [`NodeEvaluator`]), the engine
/// configuration, the adapter circuit breaker, and a rubric cache.
pub struct ModerationEngine {
    evaluator: NodeEvaluator,
    config: EngineConfig,
    cache: RubricCache,
}

impl ModerationEngine {
    pub fn new(adapter: Arc<dyn ModelAdapter>, config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self {
            evaluator: NodeEvaluator::new(adapter, &config),
            cache: RubricCache::from_config(&config.cache),
            config,
        })
    }

    pub fn builder() -> ModerationEngineBuilder {
        ModerationEngineBuilder::new()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.evaluator.circuit_breaker().state()
    }

    pub fn rubric_cache(&self) -> &RubricCache {
        &self.cache
    }

    /// Load (or reuse) the tree for these rubric and lore sources.
    pub async fn load_rubric(
        &self,
        rubric_source: &str,
        lore_source: &str,
    ) -> Result<Arc<RubricTree>, EngineError> {
        Ok(self.cache.get_or_load(rubric_source, lore_source).await?)
    }

    pub async fn load_rubric_files(
        &self,
        rubric_path: impl AsRef<Path>,
        lore_path: impl AsRef<Path>,
    ) -> Result<Arc<RubricTree>, EngineError> {
        Ok(self
            .cache
            .get_or_load_files(rubric_path, lore_path)
            .await?)
    }

    /// Evaluate `comment` against `tree`.
    ///
    /// Blank `conversation_context` is treated as absent.
    pub async fn evaluate_comment(
        &self,
        comment: &str,
        conversation_context: Option<&str>,
        tree: Arc<RubricTree>,
    ) -> AggregateResult {
        let mut ctx = EvaluationContext::new(comment, tree);
        if let Some(conversation) = conversation_context {
            ctx = ctx.with_conversation(conversation);
        }
        self.evaluate(&ctx).await
    }

    /// Evaluate a prepared context with the engine configuration.
    pub async fn evaluate(&self, ctx: &EvaluationContext) -> AggregateResult {
        // validated in `new`
        self.run(ctx, &self.config).await
    }

    /// Evaluate with per-request settings.
    ///
    /// `config` supplies concurrency, deadline, call timeout, retry policy
    /// and thresholds; the circuit breaker and cache stay engine-wide.
    /// Invalid settings are rejected before any adapter call.
    pub async fn evaluate_with(
        &self,
        ctx: &EvaluationContext,
        config: &EngineConfig,
    ) -> Result<AggregateResult, EngineError> {
        config.validate()?;
        Ok(self.run(ctx, config).await)
    }

    async fn run(&self, ctx: &EvaluationContext, config: &EngineConfig) -> AggregateResult {
        let tree = ctx.tree.as_ref();
        let span = tracing::info_span!(
            "evaluate_comment",
            rubric = %short(&tree.fingerprint),
            leaves = tree.leaf_count()
        );

        async move {
            let results = self.run_leaves(tree, ctx, config).await;
            let result = Aggregator::new(config.thresholds).aggregate(tree, &results);
            tracing::info!(
                decision = %result.decision,
                final_score = result.final_score,
                uncertain = result.uncertain,
                "Comment evaluated"
            );
            result
        }
        .instrument(span)
        .await
    }

    /// Evaluate every leaf under the deadline, returning one result per
    /// leaf in tree order.
    async fn run_leaves(
        &self,
        tree: &RubricTree,
        ctx: &EvaluationContext,
        config: &EngineConfig,
    ) -> Vec<SubScoreResult> {
        let leaves = tree.leaf_indices();
        let limiter = Semaphore::new(config.concurrency);
        let policy = CallPolicy::from(config);
        let deadline = Instant::now() + config.deadline;

        let mut slots: Vec<Option<SubScoreResult>> = vec![None; leaves.len()];

        {
            let limiter = &limiter;
            let policy = &policy;
            let mut pending: FuturesUnordered<_> = leaves
                .iter()
                .enumerate()
                .map(|(slot, &index)| {
                    let node = tree.node(index);
                    async move {
                        let result = self
                            .evaluator
                            .evaluate_with(node, ctx, policy, Some(limiter))
                            .await;
                        (slot, result)
                    }
                })
                .collect();

            let drained = tokio::time::timeout_at(deadline, async {
                while let Some((slot, result)) = pending.next().await {
                    slots[slot] = Some(result);
                }
            })
            .await;

            if drained.is_err() {
                tracing::warn!(
                    pending = pending.len(),
                    deadline = ?config.deadline,
                    "Evaluation deadline elapsed, cancelling pending leaves"
                );
            }
        }

        slots
            .into_iter()
            .zip(leaves)
            .map(|(slot, &index)| {
                slot.unwrap_or_else(|| {
                    SubScoreResult::uncertain(tree.node(index).id.clone(), UncertainReason::Cancelled)
                })
            })
            .collect()
    }
}

impl std::fmt::Debug for ModerationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModerationEngine")
            .field("evaluator", &self.evaluator)
            .field("config", &self.config)
            .field("cached_rubrics", &self.cache.entry_count())
            .finish()
    }
}

/// Builder for [`ModerationEngine`].
pub struct ModerationEngineBuilder {
    adapter: Option<Arc<dyn ModelAdapter>>,
    config: EngineConfig,
    circuit_breaker: Option<Arc<CircuitBreaker>>,
}

impl ModerationEngineBuilder {
    pub fn new() -> Self {
        Self {
            adapter: None,
            config: EngineConfig::default(),
            circuit_breaker: None,
        }
    }

    pub fn adapter(mut self, adapter: Arc<dyn ModelAdapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Share a circuit breaker across engines using the same backend.
    pub fn circuit_breaker(mut self, circuit_breaker: Arc<CircuitBreaker>) -> Self {
        self.circuit_breaker = Some(circuit_breaker);
        self
    }

    pub fn build(self) -> Result<ModerationEngine, EngineError> {
        let adapter = self
            .adapter
            .ok_or_else(|| EngineError::NotConfigured("No adapter set".to_string()))?;

        let mut engine = ModerationEngine::new(adapter, self.config)?;
        if let Some(circuit_breaker) = self.circuit_breaker {
            engine.evaluator = engine.evaluator.with_circuit_breaker(circuit_breaker);
        }
        Ok(engine)
    }
}

impl Default for ModerationEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::ModelError;
    use async_trait::async_trait;
    use moderator_core::Decision;

    const RUBRIC: &str = r#"
root:
  kind: group
  children:
    - kind: task
      id: civility
      prompt: "Is the comment civil?"
    - kind: task
      id: relevance
      prompt: "Is the comment on topic?"
"#;

    struct FixedAdapter(&'static str);

    #[async_trait]
    impl ModelAdapter for FixedAdapter {
        async fn generate(&self, _prompt: &str) -> Result<String, ModelError> {
            Ok(self.0.to_string())
        }

        fn name(&self) -> &str {
            "fixed"
        }
    }

    #[test]
    fn test_builder_requires_adapter() {
        let err = ModerationEngine::builder().build().unwrap_err();
        assert!(matches!(err, EngineError::NotConfigured(_)));
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = EngineConfig {
            concurrency: 0,
            ..EngineConfig::default()
        };
        let err = ModerationEngine::new(Arc::new(FixedAdapter("{}")), config).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[tokio::test]
    async fn test_evaluate_comment_approves() {
        let engine = ModerationEngine::builder()
            .adapter(Arc::new(FixedAdapter(
                r#"{"base_score": 0.8, "substance_level": "high"}"#,
            )))
            .build()
            .unwrap();

        let tree = engine.load_rubric(RUBRIC, "A gardening forum.").await.unwrap();
        let result = engine
            .evaluate_comment("Great advice on pruning!", Some("OP: how to prune?"), tree)
            .await;

        assert_eq!(result.decision, Decision::Approve);
        assert!((result.final_score - 0.8).abs() < 1e-12);
        assert!(!result.uncertain);
        assert_eq!(result.outcomes.len(), 2);
    }

    #[tokio::test]
    async fn test_malformed_payloads_force_review() {
        let engine = ModerationEngine::new(
            Arc::new(FixedAdapter("not json at all")),
            EngineConfig::default(),
        )
        .unwrap();

        let tree = engine.load_rubric(RUBRIC, "").await.unwrap();
        let result = engine.evaluate_comment("hello", None, tree).await;

        assert_eq!(result.decision, Decision::NeedsReview);
        assert!((result.final_score - 0.5).abs() < 1e-12);
        assert_eq!(result.uncertain_nodes(), vec!["civility", "relevance"]);
    }

    #[tokio::test]
    async fn test_load_rubric_reports_errors() {
        let engine =
            ModerationEngine::new(Arc::new(FixedAdapter("{}")), EngineConfig::default()).unwrap();
        let err = engine.load_rubric("root: {kind: group}", "").await.unwrap_err();
        assert!(matches!(err, EngineError::Rubric(_)));
    }
}
