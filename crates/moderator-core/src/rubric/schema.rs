//! JSON Schema validation for rubric documents.
//!
//! Rubrics are validated against spec/rubric.schema.json before they are
//! decoded, so unknown node kinds and stray fields fail with a precise path.

use std::sync::OnceLock;

/// Embedded rubric schema (loaded at compile time).
const RUBRIC_SCHEMA_JSON: &str = include_str!("../../../../spec/rubric.schema.json");

/// Compiled validator (initialized once, reused).
static COMPILED_SCHEMA: OnceLock<Result<jsonschema::Validator, String>> = OnceLock::new();

fn get_validator() -> Result<&'static jsonschema::Validator, String> {
    let result = COMPILED_SCHEMA.get_or_init(|| {
        let schema_value: serde_json::Value = serde_json::from_str(RUBRIC_SCHEMA_JSON)
            .map_err(|e| format!("Invalid schema JSON: {}", e))?;

        jsonschema::options()
            .build(&schema_value)
            .map_err(|e| format!("Failed to compile schema: {}", e))
    });

    result.as_ref().map_err(|e| e.clone())
}

/// Validate a rubric document against the schema.
///
/// Returns every violation as `"<message> at <path>"`.
pub fn validate_rubric_schema(rubric_json: &serde_json::Value) -> Result<(), Vec<String>> {
    let validator = get_validator().map_err(|e| vec![e])?;

    let errors: Vec<String> = validator
        .iter_errors(rubric_json)
        .map(|e| format!("{} at {}", e, e.instance_path))
        .collect();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
