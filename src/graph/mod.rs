//! Canonical dependency graph shared by every ecosystem adapter.
//!
//! - [`GraphNode`]: a rooted tree node with an ecosystem-qualified id and
//!   optional type tags. Diamond dependencies appear once per branch.
//! - [`UniqueDependencies`]: the deduplicated id set (or id → types map)
//!   derived from the full trees of one working directory.
//! - [`flatten`]: builds the depth-one graph sent to the remote scanner.
//! - [`impact`]: projects scan findings back onto the full trees.

pub mod flatten;
pub mod impact;

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

/// Id of the synthetic root of a flattened graph.
pub const FLAT_ROOT_ID: &str = "root";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphNode {
    #[serde(rename = "component_id")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub types: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<GraphNode>,
}

impl GraphNode {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            types: None,
            nodes: Vec::new(),
        }
    }

    pub fn with_children(id: impl Into<String>, nodes: Vec<GraphNode>) -> Self {
        Self {
            id: id.into(),
            types: None,
            nodes,
        }
    }

    /// Direct child with the given id, if any.
    pub fn child(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Number of nodes below this one, counting repeats in different branches.
    pub fn descendant_count(&self) -> usize {
        self.nodes.iter().map(|n| 1 + n.descendant_count()).sum()
    }
}

/// The deduplicated dependency set of one working directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum UniqueDependencies {
    Ids(BTreeSet<String>),
    /// Used by ecosystems that distinguish package kinds (jar, pom, ...).
    Typed(BTreeMap<String, Vec<String>>),
}

impl UniqueDependencies {
    pub fn len(&self) -> usize {
        match self {
            UniqueDependencies::Ids(ids) => ids.len(),
            UniqueDependencies::Typed(map) => map.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &str) -> bool {
        match self {
            UniqueDependencies::Ids(ids) => ids.contains(id),
            UniqueDependencies::Typed(map) => map.contains_key(id),
        }
    }

    pub fn ids(&self) -> Vec<&str> {
        match self {
            UniqueDependencies::Ids(ids) => ids.iter().map(String::as_str).collect(),
            UniqueDependencies::Typed(map) => map.keys().map(String::as_str).collect(),
        }
    }

    /// Recovers the unique set from a flattened graph.
    pub fn from_flat_graph(flat: &GraphNode) -> Self {
        if flat.nodes.iter().any(|n| n.types.is_some()) {
            let map = flat
                .nodes
                .iter()
                .map(|n| (n.id.clone(), n.types.clone().unwrap_or_default()))
                .collect();
            UniqueDependencies::Typed(map)
        } else {
            UniqueDependencies::Ids(flat.nodes.iter().map(|n| n.id.clone()).collect())
        }
    }
}

/// Collects every id reachable below the roots of `trees` (roots excluded).
pub fn collect_unique_ids(trees: &[GraphNode]) -> BTreeSet<String> {
    let mut ids = BTreeSet::new();
    for tree in trees {
        collect_into(tree, &mut ids);
    }
    ids
}

fn collect_into(node: &GraphNode, ids: &mut BTreeSet<String>) {
    for child in &node.nodes {
        ids.insert(child.id.clone());
        collect_into(child, ids);
    }
}

/// Like [`collect_unique_ids`] but aggregates the type tags seen for each id.
pub fn collect_unique_types(trees: &[GraphNode]) -> BTreeMap<String, Vec<String>> {
    let mut types: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for tree in trees {
        collect_types_into(tree, &mut types);
    }
    types
        .into_iter()
        .map(|(id, set)| (id, set.into_iter().collect()))
        .collect()
}

fn collect_types_into(node: &GraphNode, types: &mut BTreeMap<String, BTreeSet<String>>) {
    for child in &node.nodes {
        let entry = types.entry(child.id.clone()).or_default();
        if let Some(tags) = &child.types {
            entry.extend(tags.iter().cloned());
        }
        collect_types_into(child, types);
    }
}

/// Adjacency list keyed by node id, used by adapters whose tools report
/// edges rather than nested trees.
pub type Edges = BTreeMap<String, Vec<String>>;

/// Expands `root` into a full tree following `edges`.
///
/// A child whose id already appears on the current path is dropped, which
/// cuts cycles while keeping diamonds intact. Ids without an entry in
/// `edges` become leaves.
pub fn expand_tree(root: &str, edges: &Edges, types: &BTreeMap<String, Vec<String>>) -> GraphNode {
    let mut path = HashSet::new();
    expand_node(root, edges, types, &mut path)
}

fn expand_node(
    id: &str,
    edges: &Edges,
    types: &BTreeMap<String, Vec<String>>,
    path: &mut HashSet<String>,
) -> GraphNode {
    path.insert(id.to_string());
    let mut node = GraphNode::new(id);
    node.types = types.get(id).cloned();
    if let Some(children) = edges.get(id) {
        for child in children {
            if path.contains(child) {
                continue;
            }
            node.nodes.push(expand_node(child, edges, types, path));
        }
    }
    path.remove(id);
    node
}
