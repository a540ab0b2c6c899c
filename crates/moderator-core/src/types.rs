//! Core types for rubric evaluation.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::rubric::RubricTree;

/// Neutral base score substituted for leaves that could not be evaluated.
pub const NEUTRAL_SCORE: f64 = 0.5;

/// Final moderation decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Approve,
    Reject,
    NeedsReview,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Approve => "APPROVE",
            Decision::Reject => "REJECT",
            Decision::NeedsReview => "NEEDS_REVIEW",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How much substance the model found in a comment for one criterion.
///
/// Ordered: `Low < Medium < High`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SubstanceLevel {
    Low,
    Medium,
    High,
}

impl SubstanceLevel {
    /// Parse a model-supplied label, ignoring case and surrounding whitespace.
    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "low" => Some(SubstanceLevel::Low),
            "medium" => Some(SubstanceLevel::Medium),
            "high" => Some(SubstanceLevel::High),
            _ => None,
        }
    }

    /// Position on the ordinal scale (0, 1, 2).
    pub fn ordinal(&self) -> f64 {
        match self {
            SubstanceLevel::Low => 0.0,
            SubstanceLevel::Medium => 1.0,
            SubstanceLevel::High => 2.0,
        }
    }

    /// Nearest level for a value on the ordinal scale; halves round up.
    pub fn from_ordinal(value: f64) -> Self {
        if value.is_nan() || value < 0.5 {
            SubstanceLevel::Low
        } else if value < 1.5 {
            SubstanceLevel::Medium
        } else {
            SubstanceLevel::High
        }
    }
}

impl fmt::Display for SubstanceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubstanceLevel::Low => f.write_str("Low"),
            SubstanceLevel::Medium => f.write_str("Medium"),
            SubstanceLevel::High => f.write_str("High"),
        }
    }
}

/// Why a leaf result is a sentinel instead of a real judgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UncertainReason {
    /// The model adapter failed (after retries, for transient failures).
    Transport { message: String },

    /// The model answered but the payload did not parse or validate.
    MalformedPayload { message: String },

    /// The evaluation deadline elapsed before the leaf resolved.
    Cancelled,

    /// The adapter circuit was open; no call was made.
    CircuitOpen,
}

impl fmt::Display for UncertainReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UncertainReason::Transport { message } => write!(f, "transport failure: {}", message),
            UncertainReason::MalformedPayload { message } => {
                write!(f, "malformed payload: {}", message)
            }
            UncertainReason::Cancelled => f.write_str("cancelled at deadline"),
            UncertainReason::CircuitOpen => f.write_str("circuit open"),
        }
    }
}

/// Per-leaf judgement. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubScoreResult {
    pub node_id: String,

    /// Score in [0, 1]
    pub base_score: f64,

    pub substance_level: SubstanceLevel,

    /// Node multiplier or the model-adjusted value
    pub multiplier: f64,

    pub uncertain: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uncertain_reason: Option<UncertainReason>,

    /// Raw model response, kept for audit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_payload: Option<String>,

    /// Adapter calls made for this leaf
    pub attempts: u32,

    pub evaluated_at: DateTime<Utc>,
}

impl SubScoreResult {
    /// A validated judgement from the model.
    pub fn scored(
        node_id: impl Into<String>,
        base_score: f64,
        substance_level: SubstanceLevel,
        multiplier: f64,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            base_score,
            substance_level,
            multiplier,
            uncertain: false,
            uncertain_reason: None,
            raw_payload: None,
            attempts: 1,
            evaluated_at: Utc::now(),
        }
    }

    /// Placeholder for a leaf that could not be evaluated.
    ///
    /// Carries the neutral midpoint with a unit multiplier so its
    /// contribution is exactly [`NEUTRAL_SCORE`].
    pub fn uncertain(node_id: impl Into<String>, reason: UncertainReason) -> Self {
        Self {
            node_id: node_id.into(),
            base_score: NEUTRAL_SCORE,
            substance_level: SubstanceLevel::Medium,
            multiplier: 1.0,
            uncertain: true,
            uncertain_reason: Some(reason),
            raw_payload: None,
            attempts: 0,
            evaluated_at: Utc::now(),
        }
    }

    pub fn with_raw_payload(mut self, raw: impl Into<String>) -> Self {
        self.raw_payload = Some(raw.into());
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// `base_score * multiplier` clamped to [0, 1].
    pub fn contribution(&self) -> f64 {
        clamp_unit(self.base_score * self.multiplier)
    }
}

/// What the aggregator saw for one leaf.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LeafOutcome {
    Scored(SubScoreResult),

    /// No result was supplied for this leaf.
    Missing { node_id: String },
}

impl LeafOutcome {
    pub fn node_id(&self) -> &str {
        match self {
            LeafOutcome::Scored(result) => &result.node_id,
            LeafOutcome::Missing { node_id } => node_id,
        }
    }

    pub fn is_uncertain(&self) -> bool {
        match self {
            LeafOutcome::Scored(result) => result.uncertain,
            LeafOutcome::Missing { .. } => true,
        }
    }

    pub fn contribution(&self) -> f64 {
        match self {
            LeafOutcome::Scored(result) => result.contribution(),
            LeafOutcome::Missing { .. } => NEUTRAL_SCORE,
        }
    }

    pub fn substance_level(&self) -> SubstanceLevel {
        match self {
            LeafOutcome::Scored(result) => result.substance_level,
            LeafOutcome::Missing { .. } => SubstanceLevel::Medium,
        }
    }

    pub fn base_score(&self) -> f64 {
        match self {
            LeafOutcome::Scored(result) => result.base_score,
            LeafOutcome::Missing { .. } => NEUTRAL_SCORE,
        }
    }
}

/// Final result of evaluating one comment against one rubric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateResult {
    /// Root contribution, clamped to [0, 1]
    pub final_score: f64,

    pub decision: Decision,

    pub substance_level: SubstanceLevel,

    /// True when any leaf was uncertain or missing
    pub uncertain: bool,

    /// One entry per leaf, in tree order
    pub outcomes: Vec<LeafOutcome>,
}

impl AggregateResult {
    /// The payload emitted to callers and audit logs.
    pub fn payload(&self) -> ResultPayload {
        ResultPayload {
            decision: self.decision,
            final_score: self.final_score,
            substance_level: self.substance_level,
            per_node_breakdown: self
                .outcomes
                .iter()
                .map(|outcome| NodeBreakdown {
                    node_id: outcome.node_id().to_string(),
                    base_score: outcome.base_score(),
                    substance_level: outcome.substance_level(),
                    uncertain: outcome.is_uncertain(),
                })
                .collect(),
        }
    }

    /// Leaves whose results are sentinels or missing.
    pub fn uncertain_nodes(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|o| o.is_uncertain())
            .map(|o| o.node_id())
            .collect()
    }
}

/// Stable wire shape for downstream moderation actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultPayload {
    pub decision: Decision,
    pub final_score: f64,
    pub substance_level: SubstanceLevel,
    pub per_node_breakdown: Vec<NodeBreakdown>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeBreakdown {
    pub node_id: String,
    pub base_score: f64,
    pub substance_level: SubstanceLevel,
    pub uncertain: bool,
}

/// Everything one evaluation request needs.
#[derive(Debug, Clone)]
pub struct EvaluationContext {
    /// The comment being moderated
    pub comment: String,

    /// Conversation or thread context supplied with this request
    pub conversation: Option<String>,

    /// Rubric to apply
    pub tree: Arc<RubricTree>,
}

impl EvaluationContext {
    pub fn new(comment: impl Into<String>, tree: Arc<RubricTree>) -> Self {
        Self {
            comment: comment.into(),
            conversation: None,
            tree,
        }
    }

    pub fn with_conversation(mut self, conversation: impl Into<String>) -> Self {
        let conversation = conversation.into();
        if !conversation.trim().is_empty() {
            self.conversation = Some(conversation);
        }
        self
    }

    /// Lore shared by every prompt of this evaluation.
    pub fn lore(&self) -> &str {
        &self.tree.lore
    }
}

/// Clamp to [0, 1]; NaN maps to 0.
pub fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}
