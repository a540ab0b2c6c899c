//! Rubric parsing from YAML/JSON.

use std::fs;
use std::path::Path;

use serde::Deserialize;

use super::schema::validate_rubric_schema;
use super::tree::{NodeIndex, NodeKind, RubricTree, RubricTreeBuilder};
use super::{fingerprint, RubricError};

/// Deepest nesting accepted from a rubric document.
const MAX_DEPTH: usize = 32;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RubricDocument {
    #[serde(default)]
    name: Option<String>,

    #[serde(default)]
    version: Option<String>,

    #[serde(default)]
    #[allow(dead_code)] // Accepted for documentation, not evaluated
    description: Option<String>,

    root: NodeDocument,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct NodeDocument {
    kind: NodeKind,

    #[serde(default)]
    id: Option<String>,

    #[serde(default)]
    #[allow(dead_code)] // Accepted for documentation, not evaluated
    description: Option<String>,

    #[serde(default)]
    weight: Option<f64>,

    #[serde(default)]
    multiplier: Option<f64>,

    #[serde(default)]
    prompt: Option<String>,

    #[serde(default)]
    children: Vec<NodeDocument>,
}

/// Parse a rubric document and its lore into a validated tree.
///
/// Never touches a model. Any structural problem is fatal and no partial
/// tree is returned.
pub fn load(rubric_source: &str, lore_source: &str) -> Result<RubricTree, RubricError> {
    let value: serde_json::Value = serde_yaml::from_str(rubric_source)?;

    validate_rubric_schema(&value).map_err(RubricError::SchemaError)?;

    let document: RubricDocument = serde_json::from_value(value)?;

    let mut builder = RubricTreeBuilder::new()
        .lore(lore_source.trim_end())
        .fingerprint(fingerprint(rubric_source, lore_source));
    if let Some(name) = document.name {
        builder = builder.name(name);
    }
    if let Some(version) = document.version {
        builder = builder.version(version);
    }

    let root = add_node(&mut builder, document.root, "root".to_string(), 0)?;
    builder.set_root(root);

    let tree = builder.build()?;
    tracing::debug!(
        rubric = tree.name.as_deref().unwrap_or("unnamed"),
        nodes = tree.len(),
        leaves = tree.leaf_count(),
        fingerprint = %tree.fingerprint,
        "Rubric loaded"
    );
    Ok(tree)
}

/// Read both assets from disk and [`load`] them.
pub fn load_files(
    rubric_path: impl AsRef<Path>,
    lore_path: impl AsRef<Path>,
) -> Result<RubricTree, RubricError> {
    let rubric_source = fs::read_to_string(rubric_path)?;
    let lore_source = fs::read_to_string(lore_path)?;
    load(&rubric_source, &lore_source)
}

/// Add a document node and its subtree. Nodes without an explicit id get a
/// path-based one (`root.children[2]`).
fn add_node(
    builder: &mut RubricTreeBuilder,
    doc: NodeDocument,
    path: String,
    depth: usize,
) -> Result<NodeIndex, RubricError> {
    if depth > MAX_DEPTH {
        return Err(RubricError::Malformed(format!(
            "rubric nesting exceeds {} levels at '{}'",
            MAX_DEPTH, path
        )));
    }

    let id = doc.id.unwrap_or_else(|| path.clone());
    let weight = doc.weight.unwrap_or(1.0);

    let index = match doc.kind {
        NodeKind::Task => {
            if !doc.children.is_empty() {
                return Err(RubricError::Malformed(format!(
                    "task '{}' cannot have children",
                    id
                )));
            }
            let prompt = doc.prompt.ok_or_else(|| {
                RubricError::Malformed(format!("task '{}' has no prompt", id))
            })?;
            builder.add_task(id, prompt, weight, doc.multiplier.unwrap_or(1.0))
        }
        NodeKind::Group => {
            if doc.prompt.is_some() {
                return Err(RubricError::Malformed(format!(
                    "group '{}' cannot have a prompt",
                    id
                )));
            }
            let group = builder.add_group(id, weight);
            for (i, child) in doc.children.into_iter().enumerate() {
                let child_path = format!("{}.children[{}]", path, i);
                let child_index = add_node(builder, child, child_path, depth + 1)?;
                builder.attach(group, child_index);
            }
            group
        }
    };

    Ok(index)
}
