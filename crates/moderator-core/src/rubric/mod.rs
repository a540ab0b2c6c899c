//! Rubric loading and the in-memory evaluation tree.
//!
//! A rubric is a nested criterion document (YAML or JSON) validated against
//! an embedded JSON Schema and compiled into an arena-backed [`RubricTree`].
//! The free-text lore document is stored on the tree and shared by every
//! prompt built from it.

mod parser;
mod schema;
mod tree;

pub use parser::{load, load_files};
pub use schema::validate_rubric_schema;
pub use tree::{NodeIndex, NodeKind, RubricNode, RubricTree, RubricTreeBuilder};

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Fatal load-time errors. No partial tree is ever returned.
#[derive(Error, Debug)]
pub enum RubricError {
    #[error("Failed to read rubric asset: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse rubric YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Failed to decode rubric: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Rubric failed schema validation: {}", .0.join("; "))]
    SchemaError(Vec<String>),

    #[error("Malformed rubric: {0}")]
    Malformed(String),

    #[error("Rubric has no task criteria")]
    Empty,

    #[error("Rubric structure is cyclic: {0}")]
    Cyclic(String),
}

impl RubricError {
    /// True for every error caused by the shape of the rubric document
    /// rather than by I/O or emptiness.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            RubricError::YamlError(_)
                | RubricError::JsonError(_)
                | RubricError::SchemaError(_)
                | RubricError::Malformed(_)
                | RubricError::Cyclic(_)
        )
    }
}

/// SHA-256 over both assets, hex encoded.
///
/// Sources are length-prefixed so moving text between the rubric and the
/// lore changes the fingerprint.
pub fn fingerprint(rubric_source: &str, lore_source: &str) -> String {
    let mut hasher = Sha256::new();
    for part in [rubric_source, lore_source] {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}
