//! # moderator-core
//!
//! Deterministic half of the comment moderation engine.
//!
//! This crate answers two questions without ever calling a model:
//! - What criteria does a rubric define, and how are they nested?
//! - Given per-criterion sub-scores, what is the final score and decision?
//!
//! ## Key Guarantees
//!
//! 1. **Fatal load errors**: a malformed or empty rubric never yields a tree
//! 2. **Pure aggregation**: same tree + same sub-scores = same result
//! 3. **Clamped scores**: every contribution and the final score lie in [0, 1]
//! 4. **No masking**: any uncertain leaf forces NEEDS_REVIEW
//!
//! ## Example
//!
//! ```rust,ignore
//! use moderator_core::{load, Aggregator, SubScoreResult, SubstanceLevel};
//!
//! let tree = load(&rubric_yaml, &lore_text)?;
//! let results = vec![SubScoreResult::scored("civility", 0.9, SubstanceLevel::High, 1.0)];
//! let result = Aggregator::default().aggregate(&tree, &results);
//!
//! println!("{} ({:.2})", result.decision, result.final_score);
//! ```

pub mod aggregator;
pub mod rubric;
pub mod types;

// Re-export main types at crate root
pub use aggregator::{aggregate, Aggregator, DecisionPolicy, PolicyError};
pub use rubric::{
    fingerprint, load, load_files, NodeIndex, NodeKind, RubricError, RubricNode, RubricTree,
    RubricTreeBuilder,
};
pub use types::{
    clamp_unit, AggregateResult, Decision, EvaluationContext, LeafOutcome, NodeBreakdown,
    ResultPayload, SubScoreResult, SubstanceLevel, UncertainReason, NEUTRAL_SCORE,
};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const RUBRIC: &str = r#"
name: "Thread quality"
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

    #[test]
    fn test_load_then_aggregate() {
        let tree = load(RUBRIC, "The forum discusses gardening.").unwrap();
        let results = vec![
            SubScoreResult::scored("civility", 0.8, SubstanceLevel::High, 1.0),
            SubScoreResult::scored("relevance", 0.9, SubstanceLevel::Medium, 1.0),
        ];

        let result = Aggregator::default().aggregate(&tree, &results);
        assert_eq!(result.decision, Decision::Approve);
        assert!((result.final_score - 0.85).abs() < 1e-12);
    }

    #[test]
    fn test_context_exposes_lore() {
        let tree = Arc::new(load(RUBRIC, "Gardening forum.").unwrap());
        let ctx = EvaluationContext::new("Nice tomatoes!", tree).with_conversation("   ");
        assert_eq!(ctx.lore(), "Gardening forum.");
        assert!(ctx.conversation.is_none());
    }
}
