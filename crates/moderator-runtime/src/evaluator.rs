//! Node evaluator: one rubric leaf against one comment.
//!
//! The evaluator never fails outward. Every path ends in a
//! [`SubScoreResult`]; anything short of a validated judgement becomes an
//! uncertain sentinel carrying the reason.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backon::Retryable;
use tokio::sync::Semaphore;

use moderator_core::{EvaluationContext, RubricNode, SubScoreResult, UncertainReason};

use crate::adapter::{ModelAdapter, ModelError};
use crate::config::EngineConfig;
use crate::prompts::build_prompt;
use crate::resilience::{honor_retry_after, CircuitBreaker, RetryConfig};
use crate::response::parse_judgement;

/// Longest raw payload echoed into a warning.
const LOG_PAYLOAD_CHARS: usize = 200;

/// Per-call settings for one evaluation.
#[derive(Debug, Clone)]
pub struct CallPolicy {
    pub retry: RetryConfig,
    pub call_timeout: Duration,
}

impl From<&EngineConfig> for CallPolicy {
    fn from(config: &EngineConfig) -> Self {
        Self {
            retry: config.retry.clone(),
            call_timeout: config.call_timeout,
        }
    }
}

impl Default for CallPolicy {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

/// Evaluates task nodes through a [`ModelAdapter`].
pub struct NodeEvaluator {
    adapter: Arc<dyn ModelAdapter>,
    circuit_breaker: Arc<CircuitBreaker>,
    policy: CallPolicy,
}

impl NodeEvaluator {
    pub fn new(adapter: Arc<dyn ModelAdapter>, config: &EngineConfig) -> Self {
        Self {
            adapter,
            circuit_breaker: Arc::new(CircuitBreaker::new(config.circuit_breaker.clone())),
            policy: CallPolicy::from(config),
        }
    }

    /// Share a circuit breaker with other evaluators of the same backend.
    pub fn with_circuit_breaker(mut self, circuit_breaker: Arc<CircuitBreaker>) -> Self {
        self.circuit_breaker = circuit_breaker;
        self
    }

    pub fn adapter(&self) -> &Arc<dyn ModelAdapter> {
        &self.adapter
    }

    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.circuit_breaker
    }

    /// Evaluate a single task node.
    pub async fn evaluate(&self, node: &RubricNode, ctx: &EvaluationContext) -> SubScoreResult {
        self.evaluate_with(node, ctx, &self.policy, None).await
    }

    /// Evaluate with explicit call settings, holding a `limiter` permit
    /// for the duration of each adapter call.
    pub async fn evaluate_with(
        &self,
        node: &RubricNode,
        ctx: &EvaluationContext,
        policy: &CallPolicy,
        limiter: Option<&Semaphore>,
    ) -> SubScoreResult {
        if !node.is_task() {
            tracing::warn!(node = %node.id, "Group node passed to evaluator");
            return SubScoreResult::uncertain(
                node.id.clone(),
                UncertainReason::MalformedPayload {
                    message: "not a task node".to_string(),
                },
            );
        }

        if !self.circuit_breaker.allow_request() {
            tracing::warn!(node = %node.id, adapter = self.adapter.name(), "Circuit open, skipping adapter call");
            return SubScoreResult::uncertain(node.id.clone(), UncertainReason::CircuitOpen);
        }

        let prompt = build_prompt(node, ctx);
        let attempts = AtomicU32::new(0);

        let outcome = {
            let prompt = prompt.as_str();
            let attempts = &attempts;
            let adapter = self.adapter.as_ref();
            let call_timeout = policy.call_timeout;

            (|| async move {
                let _permit = match limiter {
                    Some(semaphore) => semaphore.acquire().await.ok(),
                    None => None,
                };
                attempts.fetch_add(1, Ordering::Relaxed);
                match tokio::time::timeout(call_timeout, adapter.generate(prompt)).await {
                    Ok(result) => result,
                    Err(_) => Err(ModelError::Timeout(call_timeout)),
                }
            })
            .retry(policy.retry.backoff())
            .when(ModelError::is_transient)
            .adjust(honor_retry_after)
            .notify(|err: &ModelError, delay: Duration| {
                tracing::debug!(node = %node.id, error = %err, delay = ?delay, "Retrying adapter call");
            })
            .await
        };

        let attempts = attempts.load(Ordering::Relaxed);

        match outcome {
            Ok(raw) => {
                self.circuit_breaker.record_success();
                match parse_judgement(&raw) {
                    Ok(judgement) => {
                        tracing::debug!(
                            node = %node.id,
                            base_score = judgement.base_score,
                            substance = %judgement.substance_level,
                            attempts,
                            "Leaf scored"
                        );
                        SubScoreResult::scored(
                            node.id.clone(),
                            judgement.base_score,
                            judgement.substance_level,
                            judgement.multiplier.unwrap_or(node.multiplier),
                        )
                        .with_raw_payload(raw)
                        .with_attempts(attempts)
                    }
                    Err(e) => {
                        tracing::warn!(
                            node = %node.id,
                            error = %e,
                            payload = %truncate(&raw, LOG_PAYLOAD_CHARS),
                            "Malformed judge payload"
                        );
                        SubScoreResult::uncertain(
                            node.id.clone(),
                            UncertainReason::MalformedPayload {
                                message: e.to_string(),
                            },
                        )
                        .with_raw_payload(raw)
                        .with_attempts(attempts)
                    }
                }
            }
            Err(e) => {
                self.circuit_breaker.record_failure();
                tracing::warn!(
                    node = %node.id,
                    adapter = self.adapter.name(),
                    error = %e,
                    transient = e.is_transient(),
                    attempts,
                    "Adapter call failed"
                );
                SubScoreResult::uncertain(
                    node.id.clone(),
                    UncertainReason::Transport {
                        message: e.to_string(),
                    },
                )
                .with_attempts(attempts)
            }
        }
    }
}

impl std::fmt::Debug for NodeEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeEvaluator")
            .field("adapter", &self.adapter.name())
            .field("circuit_breaker", &self.circuit_breaker)
            .field("policy", &self.policy)
            .finish()
    }
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::CircuitBreakerConfig;
    use async_trait::async_trait;
    use moderator_core::{load, SubstanceLevel};
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    const RUBRIC: &str = r#"
root:
  kind: group
  children:
    - kind: task
      id: civility
      multiplier: 1.2
      prompt: "Is the comment civil?"
"#;

    /// Replays scripted replies, then repeats the last one.
    struct ScriptedAdapter {
        replies: Mutex<VecDeque<Result<String, ModelError>>>,
        calls: AtomicU32,
    }

    impl ScriptedAdapter {
        fn new(replies: Vec<Result<String, ModelError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ModelAdapter for ScriptedAdapter {
        async fn generate(&self, _prompt: &str) -> Result<String, ModelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut replies = self.replies.lock();
            if replies.len() > 1 {
                replies.pop_front().unwrap_or(Err(ModelError::AuthError))
            } else {
                replies.front().cloned().unwrap_or(Err(ModelError::AuthError))
            }
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn fast_config() -> EngineConfig {
        EngineConfig {
            retry: RetryConfig {
                max_retries: 2,
                min_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
                jitter: false,
            },
            ..EngineConfig::default()
        }
    }

    fn context() -> (EvaluationContext, RubricNode) {
        let tree = Arc::new(load(RUBRIC, "lore").unwrap());
        let node = tree.leaves().next().unwrap().clone();
        (EvaluationContext::new("Thanks for the tip!", tree), node)
    }

    #[tokio::test]
    async fn test_valid_payload_scores_leaf() {
        let adapter = ScriptedAdapter::new(vec![Ok(
            r#"{"base_score": 0.9, "substance_level": "high"}"#.to_string(),
        )]);
        let evaluator = NodeEvaluator::new(adapter.clone(), &fast_config());
        let (ctx, node) = context();

        let result = evaluator.evaluate(&node, &ctx).await;
        assert!(!result.uncertain);
        assert_eq!(result.base_score, 0.9);
        assert_eq!(result.substance_level, SubstanceLevel::High);
        assert_eq!(result.multiplier, 1.2);
        assert_eq!(result.attempts, 1);
        assert!(result.raw_payload.is_some());
        assert_eq!(adapter.calls(), 1);
    }

    #[tokio::test]
    async fn test_model_multiplier_overrides_node() {
        let adapter = ScriptedAdapter::new(vec![Ok(
            r#"{"base_score": 0.5, "substance_level": "low", "multiplier": 0.5}"#.to_string(),
        )]);
        let evaluator = NodeEvaluator::new(adapter, &fast_config());
        let (ctx, node) = context();

        let result = evaluator.evaluate(&node, &ctx).await;
        assert_eq!(result.multiplier, 0.5);
        assert_eq!(result.contribution(), 0.25);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let adapter = ScriptedAdapter::new(vec![
            Err(ModelError::HttpError("connection reset".into())),
            Err(ModelError::RateLimited { retry_after: None }),
            Ok(r#"{"base_score": 0.6, "substance_level": "medium"}"#.to_string()),
        ]);
        let evaluator = NodeEvaluator::new(adapter.clone(), &fast_config());
        let (ctx, node) = context();

        let result = evaluator.evaluate(&node, &ctx).await;
        assert!(!result.uncertain);
        assert_eq!(result.base_score, 0.6);
        assert_eq!(result.attempts, 3);
        assert_eq!(adapter.calls(), 3);
    }

    #[tokio::test]
    async fn test_retries_exhausted_yield_sentinel() {
        let adapter = ScriptedAdapter::new(vec![Err(ModelError::ApiError {
            status: 503,
            message: "overloaded".into(),
        })]);
        let evaluator = NodeEvaluator::new(adapter.clone(), &fast_config());
        let (ctx, node) = context();

        let result = evaluator.evaluate(&node, &ctx).await;
        assert!(result.uncertain);
        assert_eq!(result.base_score, 0.5);
        assert_eq!(result.multiplier, 1.0);
        assert_eq!(result.substance_level, SubstanceLevel::Medium);
        assert!(matches!(
            result.uncertain_reason,
            Some(UncertainReason::Transport { .. })
        ));
        assert_eq!(adapter.calls(), 3);
        assert_eq!(result.attempts, 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let adapter = ScriptedAdapter::new(vec![Err(ModelError::AuthError)]);
        let evaluator = NodeEvaluator::new(adapter.clone(), &fast_config());
        let (ctx, node) = context();

        let result = evaluator.evaluate(&node, &ctx).await;
        assert!(result.uncertain);
        assert_eq!(adapter.calls(), 1);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_not_retried() {
        let adapter = ScriptedAdapter::new(vec![Ok("I think it is fine.".to_string())]);
        let evaluator = NodeEvaluator::new(adapter.clone(), &fast_config());
        let (ctx, node) = context();

        let result = evaluator.evaluate(&node, &ctx).await;
        assert!(result.uncertain);
        assert!(matches!(
            result.uncertain_reason,
            Some(UncertainReason::MalformedPayload { .. })
        ));
        assert_eq!(result.raw_payload.as_deref(), Some("I think it is fine."));
        assert_eq!(adapter.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_waits_for_retry_after() {
        let adapter = ScriptedAdapter::new(vec![
            Err(ModelError::RateLimited {
                retry_after: Some(Duration::from_secs(5)),
            }),
            Ok(r#"{"base_score": 0.7, "substance_level": "medium"}"#.to_string()),
        ]);
        let evaluator = NodeEvaluator::new(adapter.clone(), &fast_config());
        let (ctx, node) = context();

        let started = tokio::time::Instant::now();
        let result = evaluator.evaluate(&node, &ctx).await;

        assert!(!result.uncertain);
        assert_eq!(result.attempts, 2);
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    struct HangingAdapter;

    #[async_trait]
    impl ModelAdapter for HangingAdapter {
        async fn generate(&self, _prompt: &str) -> Result<String, ModelError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(String::new())
        }

        fn name(&self) -> &str {
            "hanging"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_timeout_becomes_transport_sentinel() {
        let config = EngineConfig {
            call_timeout: Duration::from_secs(1),
            retry: RetryConfig::none(),
            ..EngineConfig::default()
        };
        let evaluator = NodeEvaluator::new(Arc::new(HangingAdapter), &config);
        let (ctx, node) = context();

        let result = evaluator.evaluate(&node, &ctx).await;
        assert!(result.uncertain);
        match result.uncertain_reason {
            Some(UncertainReason::Transport { message }) => assert!(message.contains("Timeout")),
            other => panic!("unexpected reason: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_open_circuit_skips_adapter() {
        let adapter = ScriptedAdapter::new(vec![Err(ModelError::AuthError)]);
        let config = EngineConfig {
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: 1,
                recovery_timeout: Duration::from_secs(60),
                success_threshold: 1,
            },
            ..fast_config()
        };
        let evaluator = NodeEvaluator::new(adapter.clone(), &config);
        let (ctx, node) = context();

        let first = evaluator.evaluate(&node, &ctx).await;
        assert!(first.uncertain);

        let second = evaluator.evaluate(&node, &ctx).await;
        assert_eq!(second.uncertain_reason, Some(UncertainReason::CircuitOpen));
        assert_eq!(second.attempts, 0);
        assert_eq!(adapter.calls(), 1);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("hi", 10), "hi");
    }
}
