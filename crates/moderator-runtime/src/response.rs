//! Parsing and validation of judge responses.
//!
//! Models wrap JSON in code fences or add prose around it, and sometimes
//! quote numbers. The parser takes the first JSON object it can find,
//! coerces numeric strings, then validates ranges.

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

use moderator_core::SubstanceLevel;

lazy_static! {
    static ref FENCED_JSON: Regex =
        Regex::new(r"(?s)```(?:json|JSON)?\s*(\{.*?\})\s*```").unwrap();
}

/// Why a judge response was rejected.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PayloadError {
    #[error("no JSON object in response")]
    NoJson,

    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    #[error("missing field '{0}'")]
    MissingField(&'static str),

    #[error("field '{field}' is not a number: {value}")]
    NotANumber { field: &'static str, value: String },

    #[error("field '{field}' out of range: {value}")]
    OutOfRange { field: &'static str, value: f64 },

    #[error("unknown substance level '{0}'")]
    UnknownSubstance(String),
}

/// A validated judgement.
#[derive(Debug, Clone, PartialEq)]
pub struct Judgement {
    pub base_score: f64,
    pub substance_level: SubstanceLevel,

    /// Model-adjusted multiplier, if the model supplied one
    pub multiplier: Option<f64>,

    pub final_score: Option<f64>,
    pub decision: Option<String>,
}

/// Parse a raw model response into a [`Judgement`].
pub fn parse_judgement(text: &str) -> Result<Judgement, PayloadError> {
    let object = extract_object(text)?;

    let base_score = required_number(&object, "base_score")?;
    if !base_score.is_finite() || !(0.0..=1.0).contains(&base_score) {
        return Err(PayloadError::OutOfRange {
            field: "base_score",
            value: base_score,
        });
    }

    let substance_level = match object.get("substance_level") {
        Some(JsonValue::String(label)) => SubstanceLevel::parse(label)
            .ok_or_else(|| PayloadError::UnknownSubstance(label.clone()))?,
        Some(other) => return Err(PayloadError::UnknownSubstance(other.to_string())),
        None => return Err(PayloadError::MissingField("substance_level")),
    };

    let multiplier = optional_number(&object, "multiplier")?;
    if let Some(value) = multiplier {
        if !value.is_finite() || value <= 0.0 {
            return Err(PayloadError::OutOfRange {
                field: "multiplier",
                value,
            });
        }
    }

    // Informational only; a bad value here does not reject the judgement
    let final_score = optional_number(&object, "final_score").ok().flatten();
    let decision = object
        .get("decision")
        .and_then(JsonValue::as_str)
        .map(str::to_string);

    Ok(Judgement {
        base_score,
        substance_level,
        multiplier,
        final_score,
        decision,
    })
}

fn extract_object(text: &str) -> Result<Map<String, JsonValue>, PayloadError> {
    let candidate = match FENCED_JSON.captures(text).and_then(|c| c.get(1)) {
        Some(m) => m.as_str(),
        None => {
            let start = text.find('{').ok_or(PayloadError::NoJson)?;
            let end = text.rfind('}').ok_or(PayloadError::NoJson)?;
            if end < start {
                return Err(PayloadError::NoJson);
            }
            &text[start..=end]
        }
    };

    match serde_json::from_str::<JsonValue>(candidate) {
        Ok(JsonValue::Object(map)) => Ok(map),
        Ok(_) => Err(PayloadError::NoJson),
        Err(e) => Err(PayloadError::InvalidJson(e.to_string())),
    }
}

fn coerce_number(field: &'static str, value: &JsonValue) -> Result<f64, PayloadError> {
    match value {
        JsonValue::Number(n) => n.as_f64().ok_or_else(|| PayloadError::NotANumber {
            field,
            value: n.to_string(),
        }),
        JsonValue::String(s) => s.trim().parse::<f64>().map_err(|_| PayloadError::NotANumber {
            field,
            value: s.clone(),
        }),
        other => Err(PayloadError::NotANumber {
            field,
            value: other.to_string(),
        }),
    }
}

fn required_number(
    object: &Map<String, JsonValue>,
    field: &'static str,
) -> Result<f64, PayloadError> {
    match object.get(field) {
        None | Some(JsonValue::Null) => Err(PayloadError::MissingField(field)),
        Some(value) => coerce_number(field, value),
    }
}

fn optional_number(
    object: &Map<String, JsonValue>,
    field: &'static str,
) -> Result<Option<f64>, PayloadError> {
    match object.get(field) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(value) => coerce_number(field, value).map(Some),
    }
}
