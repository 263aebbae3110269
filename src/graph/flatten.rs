use tracing::{debug, enabled, Level};

use super::{GraphNode, UniqueDependencies, FLAT_ROOT_ID};

/// Collapse a unique dependency set into one synthetic root with one child
/// per distinct id. Type tags are carried over when the ecosystem has them.
pub fn flatten(unique: &UniqueDependencies) -> GraphNode {
    log_unique_dependencies(unique);

    let nodes = match unique {
        UniqueDependencies::Ids(ids) => ids.iter().map(GraphNode::new).collect(),
        UniqueDependencies::Typed(map) => map
            .iter()
            .map(|(id, types)| GraphNode {
                id: id.clone(),
                types: Some(types.clone()),
                nodes: Vec::new(),
            })
            .collect(),
    };

    GraphNode::with_children(FLAT_ROOT_ID, nodes)
}

fn log_unique_dependencies(unique: &UniqueDependencies) {
    // serializing large lists is not free, skip it unless someone reads it
    if !enabled!(Level::DEBUG) {
        return;
    }
    match serde_json::to_string_pretty(unique) {
        Ok(json) => debug!("Unique dependencies list:\n{}", json),
        Err(e) => debug!(error = %e, "Failed to serialize unique dependencies"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::collect_unique_ids;
    use std::collections::{BTreeMap, BTreeSet};

    fn ids(items: &[&str]) -> UniqueDependencies {
        UniqueDependencies::Ids(items.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_flatten_is_depth_one() {
        let flat = flatten(&ids(&["npm://a:1.0.0", "npm://b:2.0.0"]));
        assert_eq!(flat.id, FLAT_ROOT_ID);
        assert_eq!(flat.nodes.len(), 2);
        assert!(flat.nodes.iter().all(|n| n.nodes.is_empty() && n.types.is_none()));
    }

    #[test]
    fn test_flatten_is_idempotent() {
        let mut typed = BTreeMap::new();
        typed.insert("gav://g:a:1".to_string(), vec!["jar".to_string()]);
        typed.insert("gav://g:b:1".to_string(), vec!["pom".to_string(), "jar".to_string()]);

        for unique in [ids(&["pypi://x:1", "pypi://y:2"]), UniqueDependencies::Typed(typed)] {
            let once = flatten(&unique);
            let twice = flatten(&UniqueDependencies::from_flat_graph(&once));
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn test_diamond_dependency_flattens_once() {
        let pexpect = || {
            GraphNode::with_children(
                "pypi://pexpect:4.8.0",
                vec![GraphNode::new("pypi://ptyprocess:0.7.0")],
            )
        };
        let trees = vec![
            GraphNode::with_children("pypi://root-a:1.0", vec![pexpect()]),
            GraphNode::with_children("pypi://root-b:1.0", vec![pexpect()]),
        ];
        let flat = flatten(&UniqueDependencies::Ids(collect_unique_ids(&trees)));
        let count = flat
            .nodes
            .iter()
            .filter(|n| n.id == "pypi://ptyprocess:0.7.0")
            .count();
        assert_eq!(count, 1);

        // every flat node is reachable in the full trees and vice versa
        let flat_ids: BTreeSet<String> = flat.nodes.iter().map(|n| n.id.clone()).collect();
        assert_eq!(flat_ids, collect_unique_ids(&trees));
    }
}
