use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::TreeBuildError;
use crate::graph::{expand_tree, Edges, GraphNode};
use crate::models::Technology;

use super::{read_descriptor, BuildContext, DependencyTrees, TreeBuilder};

const GO_PROXY_PATH: &str = "api/go/{repo}";
const PUBLIC_PROXY: &str = "https://proxy.golang.org";
/// Pseudo modules `go mod graph` reports for the language and toolchain versions.
const PSEUDO_MODULES: &[&str] = &["go", "toolchain"];

/// Runs `go mod graph` and rebuilds the module tree.
pub struct GoBuilder;

/// Module path declared by `go.mod`.
pub(crate) fn module_path(go_mod: &str) -> Option<String> {
    go_mod.lines().find_map(|line| {
        let rest = line.trim().strip_prefix("module")?;
        if !rest.starts_with(char::is_whitespace) {
            return None;
        }
        let path = rest.trim().trim_matches('"');
        (!path.is_empty()).then(|| path.to_string())
    })
}

/// Module proxy case encoding: every uppercase letter becomes `!` plus its
/// lowercase form.
pub(crate) fn escape_module_path(path: &str) -> String {
    let mut escaped = String::with_capacity(path.len());
    for c in path.chars() {
        if c.is_ascii_uppercase() {
            escaped.push('!');
            escaped.push(c.to_ascii_lowercase());
        } else {
            escaped.push(c);
        }
    }
    escaped
}

fn split_module(module: &str) -> (&str, &str) {
    module.split_once('@').unwrap_or((module, ""))
}

/// Parse `go mod graph` into the module tree rooted at `module`.
pub(crate) fn parse_mod_graph(output: &str, module: &str) -> (GraphNode, Vec<(String, String)>) {
    let root_id = Technology::Go.node_id(module, "");
    let mut edges = Edges::new();
    let mut modules: Vec<(String, String)> = Vec::new();

    for line in output.lines() {
        let mut parts = line.split_whitespace();
        let (Some(parent), Some(child)) = (parts.next(), parts.next()) else {
            continue;
        };
        let (parent_path, parent_version) = split_module(parent);
        let (child_path, child_version) = split_module(child);
        if PSEUDO_MODULES.contains(&parent_path) || PSEUDO_MODULES.contains(&child_path) {
            continue;
        }
        let parent_id = if parent_version.is_empty() {
            root_id.clone()
        } else {
            Technology::Go.node_id(parent_path, parent_version)
        };
        let child_id = Technology::Go.node_id(child_path, child_version);
        let children = edges.entry(parent_id).or_default();
        if !children.contains(&child_id) {
            children.push(child_id);
            let module = (child_path.to_string(), child_version.to_string());
            if !modules.contains(&module) {
                modules.push(module);
            }
        }
    }
    (expand_tree(&root_id, &edges, &BTreeMap::new()), modules)
}

#[async_trait]
impl TreeBuilder for GoBuilder {
    async fn build_trees(&self, ctx: &BuildContext) -> Result<DependencyTrees, TreeBuildError> {
        let go_mod_path = ctx.path("go.mod");
        if !go_mod_path.is_file() {
            return Err(TreeBuildError::MissingDescriptor("go.mod".to_string()));
        }
        let module = module_path(&read_descriptor(&go_mod_path)?)
            .ok_or_else(|| TreeBuildError::malformed("go", "go.mod has no module directive"))?;

        let mut graph = ctx.command("go").args(["mod", "graph"]);
        if let Some(proxy) = ctx.repository_url(GO_PROXY_PATH) {
            graph = graph.env("GOPROXY", proxy);
        }
        if let Some(curation) = &ctx.curation {
            graph = graph.env("GOMODCACHE", curation.cache_dir.to_string_lossy());
        }
        let output = ctx.run(graph).await?;

        let (tree, modules) = parse_mod_graph(&output.stdout, &module);
        let mut trees = DependencyTrees::from_trees(vec![tree]);
        if ctx.is_curation() {
            let base = ctx
                .public_repository_url(GO_PROXY_PATH)
                .unwrap_or_else(|| PUBLIC_PROXY.to_string());
            let urls = modules
                .into_iter()
                .map(|(path, version)| {
                    let url = format!(
                        "{}/{}/@v/{}.zip",
                        base.trim_end_matches('/'),
                        escape_module_path(&path),
                        version
                    );
                    (Technology::Go.node_id(&path, &version), url)
                })
                .collect();
            trees = trees.with_download_urls(urls);
        }
        Ok(trees)
    }
}
