//! Aggregator: folds leaf sub-scores into a final score and decision.
//!
//! Policy, applied bottom-up over the rubric tree:
//! 1. Task contribution is `base_score * multiplier`, clamped to [0, 1]
//! 2. Group contribution is the weight-normalized mean of its children
//! 3. The root contribution is the final score
//!
//! Decision thresholds partition [0, 1]: below `reject_max` rejects, at or
//! above `approve_min` approves, anything between needs review. A score equal
//! to `reject_max` does NOT reject; a score equal to `approve_min` approves.
//! Any uncertain or missing leaf forces NEEDS_REVIEW whatever the score.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::rubric::{RubricNode, RubricTree};
use crate::types::{
    clamp_unit, AggregateResult, Decision, LeafOutcome, SubScoreResult, SubstanceLevel,
};

/// Invalid decision thresholds.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PolicyError {
    #[error("Threshold {name} must be within [0, 1], got {value}")]
    OutOfRange { name: &'static str, value: f64 },

    #[error("reject_max ({reject_max}) must be below approve_min ({approve_min})")]
    Overlapping { reject_max: f64, approve_min: f64 },
}

/// Score thresholds mapping a final score to a decision.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DecisionPolicy {
    /// Scores strictly below this reject
    pub reject_max: f64,

    /// Scores at or above this approve
    pub approve_min: f64,
}

impl Default for DecisionPolicy {
    fn default() -> Self {
        Self {
            reject_max: 0.3,
            approve_min: 0.7,
        }
    }
}

impl DecisionPolicy {
    pub fn new(reject_max: f64, approve_min: f64) -> Result<Self, PolicyError> {
        let policy = Self {
            reject_max,
            approve_min,
        };
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        for (name, value) in [("reject_max", self.reject_max), ("approve_min", self.approve_min)] {
            if !(0.0..=1.0).contains(&value) {
                return Err(PolicyError::OutOfRange { name, value });
            }
        }
        if self.reject_max >= self.approve_min {
            return Err(PolicyError::Overlapping {
                reject_max: self.reject_max,
                approve_min: self.approve_min,
            });
        }
        Ok(())
    }

    /// Map a score to a decision, ignoring uncertainty.
    pub fn decide(&self, score: f64) -> Decision {
        if score < self.reject_max {
            Decision::Reject
        } else if score >= self.approve_min {
            Decision::Approve
        } else {
            Decision::NeedsReview
        }
    }
}

/// Aggregates leaf results for a rubric tree.
///
/// Pure: the same tree, results and policy always give the same output.
/// Never calls a model.
#[derive(Debug, Clone, Default)]
pub struct Aggregator {
    policy: DecisionPolicy,
}

impl Aggregator {
    pub fn new(policy: DecisionPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &DecisionPolicy {
        &self.policy
    }

    /// Fold `results` over `tree` into an [`AggregateResult`].
    ///
    /// Leaves with no result are recorded as [`LeafOutcome::Missing`] and
    /// count as uncertain. Results for ids that are not leaves of the tree
    /// are ignored; if a leaf has several results the first one wins.
    pub fn aggregate(&self, tree: &RubricTree, results: &[SubScoreResult]) -> AggregateResult {
        let mut by_node: HashMap<&str, &SubScoreResult> = HashMap::with_capacity(results.len());
        for result in results {
            let is_leaf = tree
                .find(&result.node_id)
                .map(|i| tree.node(i).is_task())
                .unwrap_or(false);
            if !is_leaf {
                tracing::warn!(node = %result.node_id, "Ignoring result for unknown leaf");
                continue;
            }
            match by_node.entry(result.node_id.as_str()) {
                Entry::Vacant(slot) => {
                    slot.insert(result);
                }
                Entry::Occupied(_) => {
                    tracing::warn!(node = %result.node_id, "Duplicate result, keeping the first");
                }
            }
        }

        let outcomes: Vec<LeafOutcome> = tree
            .leaves()
            .map(|leaf| match by_node.get(leaf.id.as_str()) {
                Some(result) => LeafOutcome::Scored((*result).clone()),
                None => LeafOutcome::Missing {
                    node_id: leaf.id.clone(),
                },
            })
            .collect();

        self.fold(tree, outcomes)
    }

    /// Bottom-up fold over leaf outcomes already in tree order.
    fn fold(&self, tree: &RubricTree, outcomes: Vec<LeafOutcome>) -> AggregateResult {
        let mut score = vec![0.0_f64; tree.len()];
        let mut substance = vec![0.0_f64; tree.len()];

        for (&index, outcome) in tree.leaf_indices().iter().zip(&outcomes) {
            score[index.0] = outcome.contribution();
            substance[index.0] = outcome.substance_level().ordinal();
        }

        // Reverse pre-order visits every child before its parent.
        for &index in tree.pre_order().iter().rev() {
            let node = tree.node(index);
            if node.is_group() {
                let children: Vec<&RubricNode> =
                    node.children.iter().map(|&c| tree.node(c)).collect();
                let group_score =
                    weighted_mean(node.children.iter().map(|c| score[c.0]), &children);
                let group_substance =
                    weighted_mean(node.children.iter().map(|c| substance[c.0]), &children);
                score[index.0] = clamp_unit(group_score);
                substance[index.0] = group_substance;
            }
        }

        let root = tree.root().0;
        let final_score = clamp_unit(score[root]);
        let uncertain = outcomes.iter().any(LeafOutcome::is_uncertain);
        let decision = if uncertain {
            Decision::NeedsReview
        } else {
            self.policy.decide(final_score)
        };

        AggregateResult {
            final_score,
            decision,
            substance_level: SubstanceLevel::from_ordinal(substance[root]),
            uncertain,
            outcomes,
        }
    }
}

/// `Σ vᵢwᵢ / Σ wᵢ` using each child's weight.
///
/// Weights are divided by the largest one first so the sums stay finite
/// for any positive finite weights.
fn weighted_mean(values: impl Iterator<Item = f64>, children: &[&RubricNode]) -> f64 {
    let max_weight = children
        .iter()
        .map(|child| child.weight)
        .fold(0.0_f64, f64::max);
    if max_weight <= 0.0 {
        return 0.0;
    }

    let (sum, total_weight) = values
        .zip(children)
        .fold((0.0, 0.0), |(sum, total), (value, child)| {
            let weight = child.weight / max_weight;
            (sum + value * weight, total + weight)
        });
    sum / total_weight
}

/// Aggregate with an explicit policy.
pub fn aggregate(
    tree: &RubricTree,
    results: &[SubScoreResult],
    policy: &DecisionPolicy,
) -> AggregateResult {
    Aggregator::new(*policy).aggregate(tree, results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rubric::RubricTreeBuilder;
    use crate::types::UncertainReason;
    use proptest::prelude::*;

    fn flat_tree(leaves: &[(&str, f64)]) -> RubricTree {
        let mut b = RubricTreeBuilder::new();
        let root = b.add_group("root", 1.0);
        for (id, weight) in leaves {
            let leaf = b.add_task(*id, "prompt", *weight, 1.0);
            b.attach(root, leaf);
        }
        b.build().unwrap()
    }

    fn scored(id: &str, base: f64, multiplier: f64) -> SubScoreResult {
        SubScoreResult::scored(id, base, SubstanceLevel::Medium, multiplier)
    }

    #[test]
    fn test_single_leaf_clamps_and_approves() {
        let mut b = RubricTreeBuilder::new();
        b.add_task("only", "prompt", 1.0, 1.0);
        let tree = b.build().unwrap();

        let result = Aggregator::default().aggregate(&tree, &[scored("only", 0.9, 1.2)]);
        assert_eq!(result.final_score, 1.0);
        assert_eq!(result.decision, Decision::Approve);
        assert!(!result.uncertain);
    }

    #[test]
    fn test_equal_weights_mean_rejects() {
        let tree = flat_tree(&[("a", 1.0), ("b", 1.0)]);
        let result =
            Aggregator::default().aggregate(&tree, &[scored("a", 0.2, 1.0), scored("b", 0.3, 1.0)]);
        assert!((result.final_score - 0.25).abs() < 1e-12);
        assert_eq!(result.decision, Decision::Reject);
    }

    #[test]
    fn test_weighted_mean() {
        let tree = flat_tree(&[("a", 3.0), ("b", 1.0)]);
        let result =
            Aggregator::default().aggregate(&tree, &[scored("a", 1.0, 1.0), scored("b", 0.0, 1.0)]);
        assert!((result.final_score - 0.75).abs() < 1e-12);
        assert_eq!(result.decision, Decision::Approve);
    }

    #[test]
    fn test_huge_weights_stay_finite() {
        let tree = flat_tree(&[("a", 1e308), ("b", 1e308)]);
        let result =
            Aggregator::default().aggregate(&tree, &[scored("a", 1.0, 1.0), scored("b", 1.0, 1.0)]);
        assert_eq!(result.final_score, 1.0);
        assert_eq!(result.decision, Decision::Approve);

        let tree = flat_tree(&[("a", f64::MAX), ("b", f64::MAX), ("c", 1.0)]);
        let result = Aggregator::default().aggregate(
            &tree,
            &[scored("a", 1.0, 1.0), scored("b", 0.0, 1.0), scored("c", 0.0, 1.0)],
        );
        assert!((result.final_score - 0.5).abs() < 1e-12);
        assert_eq!(result.decision, Decision::NeedsReview);
    }

    #[test]
    fn test_nested_groups() {
        let mut b = RubricTreeBuilder::new();
        let root = b.add_group("root", 1.0);
        let a = b.add_task("a", "prompt", 1.0, 1.0);
        let inner = b.add_group("inner", 1.0);
        let b1 = b.add_task("b1", "prompt", 1.0, 1.0);
        let b2 = b.add_task("b2", "prompt", 1.0, 1.0);
        b.attach(root, a);
        b.attach(root, inner);
        b.attach(inner, b1);
        b.attach(inner, b2);
        let tree = b.build().unwrap();

        // inner = (0.2 + 0.6) / 2 = 0.4; root = (1.0 + 0.4) / 2 = 0.7
        let result = Aggregator::default().aggregate(
            &tree,
            &[scored("a", 1.0, 1.0), scored("b1", 0.2, 1.0), scored("b2", 0.6, 1.0)],
        );
        assert!((result.final_score - 0.7).abs() < 1e-12);
    }

    #[test]
    fn test_boundary_equal_to_approve_min_approves() {
        let policy = DecisionPolicy::default();
        assert_eq!(policy.decide(0.7), Decision::Approve);
        assert_eq!(policy.decide(0.6999), Decision::NeedsReview);
    }

    #[test]
    fn test_boundary_equal_to_reject_max_needs_review() {
        let policy = DecisionPolicy::default();
        assert_eq!(policy.decide(0.3), Decision::NeedsReview);
        assert_eq!(policy.decide(0.2999), Decision::Reject);
    }

    #[test]
    fn test_boundaries_through_aggregate() {
        let mut b = RubricTreeBuilder::new();
        b.add_task("only", "prompt", 1.0, 1.0);
        let tree = b.build().unwrap();
        let policy = DecisionPolicy::new(0.25, 0.75).unwrap();

        let at_reject = aggregate(&tree, &[scored("only", 0.25, 1.0)], &policy);
        assert_eq!(at_reject.decision, Decision::NeedsReview);

        let at_approve = aggregate(&tree, &[scored("only", 0.75, 1.0)], &policy);
        assert_eq!(at_approve.decision, Decision::Approve);
    }

    #[test]
    fn test_uncertain_leaf_forces_review() {
        let tree = flat_tree(&[("a", 1.0), ("b", 1.0)]);
        let result = Aggregator::default().aggregate(
            &tree,
            &[
                scored("a", 1.0, 1.0),
                SubScoreResult::uncertain("b", UncertainReason::Cancelled),
            ],
        );
        // (1.0 + 0.5) / 2 would approve on its own
        assert!((result.final_score - 0.75).abs() < 1e-12);
        assert_eq!(result.decision, Decision::NeedsReview);
        assert!(result.uncertain);
        assert_eq!(result.uncertain_nodes(), vec!["b"]);
    }

    #[test]
    fn test_missing_leaf_is_marked_and_forces_review() {
        let tree = flat_tree(&[("a", 1.0), ("b", 1.0)]);
        let result = Aggregator::default().aggregate(&tree, &[scored("a", 0.0, 1.0)]);

        assert_eq!(
            result.outcomes[1],
            LeafOutcome::Missing {
                node_id: "b".to_string()
            }
        );
        assert!((result.final_score - 0.25).abs() < 1e-12);
        assert_eq!(result.decision, Decision::NeedsReview);
    }

    #[test]
    fn test_unknown_and_duplicate_results() {
        let tree = flat_tree(&[("a", 1.0)]);
        let result = Aggregator::default().aggregate(
            &tree,
            &[
                scored("ghost", 0.0, 1.0),
                scored("root", 0.0, 1.0),
                scored("a", 0.9, 1.0),
                scored("a", 0.1, 1.0),
            ],
        );
        assert_eq!(result.outcomes.len(), 1);
        assert!((result.final_score - 0.9).abs() < 1e-12);
    }

    #[test]
    fn test_outcomes_follow_tree_order() {
        let tree = flat_tree(&[("a", 1.0), ("b", 1.0), ("c", 1.0)]);
        let result = Aggregator::default().aggregate(
            &tree,
            &[scored("c", 0.5, 1.0), scored("a", 0.5, 1.0), scored("b", 0.5, 1.0)],
        );
        let ids: Vec<&str> = result.outcomes.iter().map(|o| o.node_id()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_substance_level_weighted() {
        let tree = flat_tree(&[("a", 1.0), ("b", 1.0), ("c", 1.0)]);
        let result = Aggregator::default().aggregate(
            &tree,
            &[
                SubScoreResult::scored("a", 0.5, SubstanceLevel::High, 1.0),
                SubScoreResult::scored("b", 0.5, SubstanceLevel::High, 1.0),
                SubScoreResult::scored("c", 0.5, SubstanceLevel::Low, 1.0),
            ],
        );
        // (2 + 2 + 0) / 3 = 1.33 -> Medium
        assert_eq!(result.substance_level, SubstanceLevel::Medium);
    }

    #[test]
    fn test_payload_field_names() {
        let tree = flat_tree(&[("a", 1.0)]);
        let result = Aggregator::default().aggregate(&tree, &[scored("a", 0.8, 1.0)]);
        let json = serde_json::to_value(result.payload()).unwrap();

        assert_eq!(json["decision"], "APPROVE");
        assert_eq!(json["substanceLevel"], "Medium");
        assert_eq!(json["perNodeBreakdown"][0]["nodeId"], "a");
        assert_eq!(json["perNodeBreakdown"][0]["uncertain"], false);
        assert!(json["finalScore"].is_number());
        assert!(json["perNodeBreakdown"][0]["baseScore"].is_number());
    }

    #[test]
    fn test_policy_validation() {
        assert!(DecisionPolicy::new(0.3, 0.7).is_ok());
        assert!(matches!(
            DecisionPolicy::new(0.7, 0.7),
            Err(PolicyError::Overlapping { .. })
        ));
        assert!(matches!(
            DecisionPolicy::new(-0.1, 0.7),
            Err(PolicyError::OutOfRange { .. })
        ));
        assert!(matches!(
            DecisionPolicy::new(0.3, 1.5),
            Err(PolicyError::OutOfRange { .. })
        ));
    }

    fn arb_leaf() -> impl Strategy<Value = (f64, f64, f64, bool)> {
        (0.0..=1.0_f64, 0.01..5.0_f64, 0.01..10.0_f64, any::<bool>())
    }

    proptest! {
        #[test]
        fn prop_final_score_in_unit_interval(leaves in prop::collection::vec(arb_leaf(), 1..8)) {
            let mut b = RubricTreeBuilder::new();
            let root = b.add_group("root", 1.0);
            let mut results = Vec::new();
            for (i, (base, multiplier, weight, uncertain)) in leaves.iter().enumerate() {
                let id = format!("leaf{}", i);
                let leaf = b.add_task(id.clone(), "prompt", *weight, 1.0);
                b.attach(root, leaf);
                results.push(if *uncertain {
                    SubScoreResult::uncertain(id, UncertainReason::Cancelled)
                } else {
                    scored(&id, *base, *multiplier)
                });
            }
            let tree = b.build().unwrap();
            let result = Aggregator::default().aggregate(&tree, &results);

            prop_assert!((0.0..=1.0).contains(&result.final_score));
            if results.iter().any(|r| r.uncertain) {
                prop_assert_eq!(result.decision, Decision::NeedsReview);
            } else {
                prop_assert_eq!(result.decision, DecisionPolicy::default().decide(result.final_score));
            }
        }

        #[test]
        fn prop_aggregate_is_deterministic(leaves in prop::collection::vec(arb_leaf(), 1..8)) {
            let mut b = RubricTreeBuilder::new();
            let root = b.add_group("root", 1.0);
            let mut results = Vec::new();
            for (i, (base, multiplier, weight, _)) in leaves.iter().enumerate() {
                let id = format!("leaf{}", i);
                let leaf = b.add_task(id.clone(), "prompt", *weight, 1.0);
                b.attach(root, leaf);
                results.push(scored(&id, *base, *multiplier));
            }
            let tree = b.build().unwrap();
            let aggregator = Aggregator::default();

            let first = aggregator.aggregate(&tree, &results);
            let second = aggregator.aggregate(&tree, &results);
            prop_assert_eq!(first, second);
        }
    }
}
