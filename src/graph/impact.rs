use std::collections::{BTreeMap, HashSet};

use crate::models::{ImpactPathNode, ScanResponse};

use super::GraphNode;

/// Attach root-to-component impact paths to every component of `responses`.
///
/// The scanner only saw the flattened graph, so the paths are recovered by
/// walking the full trees. Every path starts at a tree root and ends at a
/// node whose id is the component id. Paths already present on a component
/// are replaced.
pub fn build_impact_paths(mut responses: Vec<ScanResponse>, full_trees: &[GraphNode]) -> Vec<ScanResponse> {
    let mut wanted: HashSet<String> = HashSet::new();
    for response in responses.iter_mut() {
        for components in response.components_mut() {
            wanted.extend(components.keys().cloned());
        }
    }
    if wanted.is_empty() {
        return responses;
    }

    let paths = collect_paths(full_trees, &wanted);

    for response in responses.iter_mut() {
        for components in response.components_mut() {
            for (id, component) in components.iter_mut() {
                component.impact_paths = paths.get(id).cloned().unwrap_or_default();
            }
        }
    }
    responses
}

/// Every path from a root of `trees` to a node whose id is in `wanted`.
pub fn collect_paths(
    trees: &[GraphNode],
    wanted: &HashSet<String>,
) -> BTreeMap<String, Vec<Vec<ImpactPathNode>>> {
    let mut found: BTreeMap<String, Vec<Vec<ImpactPathNode>>> = BTreeMap::new();
    let mut path = Vec::new();
    for tree in trees {
        walk(tree, wanted, &mut path, &mut found);
    }
    found
}

fn walk(
    node: &GraphNode,
    wanted: &HashSet<String>,
    path: &mut Vec<ImpactPathNode>,
    found: &mut BTreeMap<String, Vec<Vec<ImpactPathNode>>>,
) {
    // malformed trees may repeat an id on one path; stop before looping
    if path.iter().any(|p| p.component_id == node.id) {
        return;
    }
    path.push(ImpactPathNode {
        component_id: node.id.clone(),
    });
    if wanted.contains(&node.id) {
        found.entry(node.id.clone()).or_default().push(path.clone());
    }
    for child in &node.nodes {
        walk(child, wanted, path, found);
    }
    path.pop();
}
