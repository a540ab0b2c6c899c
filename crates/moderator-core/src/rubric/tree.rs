//! Arena-backed rubric tree.
//!
//! Nodes live in a flat `Vec` and refer to each other by [`NodeIndex`].
//! Structure is validated once in [`RubricTreeBuilder::build`]; a built
//! tree is immutable.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::{fingerprint, RubricError};

/// Index of a node in the tree arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeIndex(pub usize);

impl fmt::Display for NodeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Group nodes aggregate children; task nodes are scored by the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Group,
    Task,
}

/// A single rubric criterion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RubricNode {
    /// Unique within the tree
    pub id: String,

    pub kind: NodeKind,

    /// Criterion prompt (tasks only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_template: Option<String>,

    /// Weight within the parent group's average
    pub weight: f64,

    /// Factor applied to a task's base score
    pub multiplier: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<NodeIndex>,

    #[serde(default)]
    pub children: Vec<NodeIndex>,
}

impl RubricNode {
    pub fn is_task(&self) -> bool {
        self.kind == NodeKind::Task
    }

    pub fn is_group(&self) -> bool {
        self.kind == NodeKind::Group
    }

    /// The prompt template, or an empty string for groups.
    pub fn prompt(&self) -> &str {
        self.prompt_template.as_deref().unwrap_or_default()
    }
}

/// An immutable, validated rubric.
#[derive(Debug, Clone)]
pub struct RubricTree {
    pub name: Option<String>,
    pub version: Option<String>,

    /// Contextual lore supplied to every prompt
    pub lore: String,

    /// Identity of the source assets, used for caching
    pub fingerprint: String,

    nodes: Vec<RubricNode>,
    root: NodeIndex,

    /// All nodes in pre-order
    order: Vec<NodeIndex>,

    /// Task nodes in pre-order
    leaves: Vec<NodeIndex>,

    by_id: HashMap<String, NodeIndex>,
}

impl RubricTree {
    pub fn root(&self) -> NodeIndex {
        self.root
    }

    pub fn root_node(&self) -> &RubricNode {
        &self.nodes[self.root.0]
    }

    pub fn node(&self, index: NodeIndex) -> &RubricNode {
        &self.nodes[index.0]
    }

    pub fn get(&self, index: NodeIndex) -> Option<&RubricNode> {
        self.nodes.get(index.0)
    }

    pub fn find(&self, id: &str) -> Option<NodeIndex> {
        self.by_id.get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Node indices in pre-order (parents before children).
    pub fn pre_order(&self) -> &[NodeIndex] {
        &self.order
    }

    /// Task node indices in pre-order.
    pub fn leaf_indices(&self) -> &[NodeIndex] {
        &self.leaves
    }

    /// Task nodes in pre-order.
    pub fn leaves(&self) -> impl Iterator<Item = &RubricNode> + '_ {
        self.leaves.iter().map(move |i| &self.nodes[i.0])
    }

    pub fn leaf_count(&self) -> usize {
        self.leaves.len()
    }

    /// Depth of a node; the root is at depth 0.
    pub fn depth(&self, index: NodeIndex) -> usize {
        let mut depth = 0;
        let mut current = self.nodes[index.0].parent;
        while let Some(parent) = current {
            depth += 1;
            current = self.nodes[parent.0].parent;
        }
        depth
    }

    /// Indented one-line-per-node outline.
    pub fn outline(&self) -> String {
        let mut out = String::new();
        for &index in &self.order {
            let node = self.node(index);
            let indent = "  ".repeat(self.depth(index));
            match node.kind {
                NodeKind::Group => out.push_str(&format!(
                    "{}{} [group, weight {}]\n",
                    indent, node.id, node.weight
                )),
                NodeKind::Task => out.push_str(&format!(
                    "{}{} [task, weight {}, multiplier {}]\n",
                    indent, node.id, node.weight, node.multiplier
                )),
            }
        }
        out
    }
}

/// Assembles arena nodes and validates them into a [`RubricTree`].
///
/// The loader uses this after parsing; tests and callers with rubrics held
/// in code can use it directly.
#[derive(Debug, Default)]
pub struct RubricTreeBuilder {
    nodes: Vec<RubricNode>,
    root: Option<NodeIndex>,
    name: Option<String>,
    version: Option<String>,
    lore: String,
    fingerprint: Option<String>,
}

impl RubricTreeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn lore(mut self, lore: impl Into<String>) -> Self {
        self.lore = lore.into();
        self
    }

    pub fn fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }

    /// Add a group node. The first node added becomes the root unless
    /// [`set_root`](Self::set_root) says otherwise.
    pub fn add_group(&mut self, id: impl Into<String>, weight: f64) -> NodeIndex {
        self.push(RubricNode {
            id: id.into(),
            kind: NodeKind::Group,
            prompt_template: None,
            weight,
            multiplier: 1.0,
            parent: None,
            children: Vec::new(),
        })
    }

    pub fn add_task(
        &mut self,
        id: impl Into<String>,
        prompt: impl Into<String>,
        weight: f64,
        multiplier: f64,
    ) -> NodeIndex {
        self.push(RubricNode {
            id: id.into(),
            kind: NodeKind::Task,
            prompt_template: Some(prompt.into()),
            weight,
            multiplier,
            parent: None,
            children: Vec::new(),
        })
    }

    /// Append `child` to `parent`'s ordered children.
    pub fn attach(&mut self, parent: NodeIndex, child: NodeIndex) {
        if let Some(node) = self.nodes.get_mut(parent.0) {
            node.children.push(child);
        }
        if let Some(node) = self.nodes.get_mut(child.0) {
            node.parent = Some(parent);
        }
    }

    pub fn set_root(&mut self, root: NodeIndex) {
        self.root = Some(root);
    }

    fn push(&mut self, node: RubricNode) -> NodeIndex {
        let index = NodeIndex(self.nodes.len());
        self.nodes.push(node);
        index
    }

    /// Validate the arena and freeze it.
    pub fn build(self) -> Result<RubricTree, RubricError> {
        if self.nodes.is_empty() {
            return Err(RubricError::Empty);
        }

        let root = self.root.unwrap_or(NodeIndex(0));
        if root.0 >= self.nodes.len() {
            return Err(RubricError::Malformed(format!("root {} is out of range", root)));
        }

        let order = self.walk(root)?;
        self.validate_nodes()?;

        let leaves: Vec<NodeIndex> = order
            .iter()
            .copied()
            .filter(|i| self.nodes[i.0].is_task())
            .collect();

        if leaves.is_empty() {
            return Err(RubricError::Empty);
        }

        if let Some(group) = self
            .nodes
            .iter()
            .find(|n| n.is_group() && n.children.is_empty())
        {
            return Err(RubricError::Malformed(format!(
                "group '{}' has no children",
                group.id
            )));
        }

        let mut by_id = HashMap::with_capacity(self.nodes.len());
        for (i, node) in self.nodes.iter().enumerate() {
            if by_id.insert(node.id.clone(), NodeIndex(i)).is_some() {
                return Err(RubricError::Malformed(format!(
                    "duplicate node id '{}'",
                    node.id
                )));
            }
        }

        let fingerprint = match self.fingerprint {
            Some(f) => f,
            None => {
                let canonical = serde_json::to_string(&self.nodes)?;
                fingerprint(&canonical, &self.lore)
            }
        };

        Ok(RubricTree {
            name: self.name,
            version: self.version,
            lore: self.lore,
            fingerprint,
            nodes: self.nodes,
            root,
            order,
            leaves,
            by_id,
        })
    }

    /// Pre-order walk from the root. Rejects revisits (cycles or shared
    /// children) and nodes the root cannot reach.
    fn walk(&self, root: NodeIndex) -> Result<Vec<NodeIndex>, RubricError> {
        let mut visited = vec![false; self.nodes.len()];
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![root];

        while let Some(index) = stack.pop() {
            if visited[index.0] {
                return Err(RubricError::Cyclic(format!(
                    "node '{}' is reachable more than once",
                    self.nodes[index.0].id
                )));
            }
            visited[index.0] = true;
            order.push(index);

            let node = &self.nodes[index.0];
            for &child in node.children.iter().rev() {
                if child.0 >= self.nodes.len() {
                    return Err(RubricError::Malformed(format!(
                        "node '{}' references missing child {}",
                        node.id, child
                    )));
                }
                stack.push(child);
            }
        }

        if let Some(orphan) = visited.iter().position(|v| !v) {
            return Err(RubricError::Malformed(format!(
                "node '{}' is not reachable from the root",
                self.nodes[orphan].id
            )));
        }

        Ok(order)
    }

    fn validate_nodes(&self) -> Result<(), RubricError> {
        for node in &self.nodes {
            if node.id.trim().is_empty() {
                return Err(RubricError::Malformed("node id must not be empty".to_string()));
            }
            if !(node.weight.is_finite() && node.weight > 0.0) {
                return Err(RubricError::Malformed(format!(
                    "node '{}' weight must be a positive number, got {}",
                    node.id, node.weight
                )));
            }
            if !(node.multiplier.is_finite() && node.multiplier > 0.0) {
                return Err(RubricError::Malformed(format!(
                    "node '{}' multiplier must be a positive number, got {}",
                    node.id, node.multiplier
                )));
            }
            if node.is_task() {
                if !node.children.is_empty() {
                    return Err(RubricError::Malformed(format!(
                        "task '{}' cannot have children",
                        node.id
                    )));
                }
                if node.prompt().trim().is_empty() {
                    return Err(RubricError::Malformed(format!(
                        "task '{}' has no prompt",
                        node.id
                    )));
                }
            }
        }
        Ok(())
    }
}
