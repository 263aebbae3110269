use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::command::CommandInvocation;
use crate::config::NpmScope;
use crate::error::TreeBuildError;
use crate::graph::GraphNode;
use crate::models::Technology;

use super::{dir_name, read_descriptor, BuildContext, DependencyTrees, TreeBuilder};

const LOCK_FILES: &[&str] = &["npm-shrinkwrap.json", "package-lock.json"];
const NPM_REGISTRY_PATH: &str = "api/npm/{repo}";

/// Reads `package-lock.json` (lockfile v2/v3), generating it in a scratch
/// copy of the project when it is missing.
pub struct NpmBuilder;

#[derive(Debug, Default, Deserialize)]
pub(crate) struct PackageLock {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default, rename = "lockfileVersion")]
    pub lockfile_version: u32,
    /// Install location (`""`, `node_modules/a`, `packages/ws`) → entry.
    #[serde(default)]
    pub packages: BTreeMap<String, LockEntry>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct LockEntry {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub resolved: Option<String>,
    #[serde(default)]
    pub link: bool,
    #[serde(default)]
    pub dev: bool,
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default, rename = "devDependencies")]
    pub dev_dependencies: BTreeMap<String, String>,
    #[serde(default, rename = "optionalDependencies")]
    pub optional_dependencies: BTreeMap<String, String>,
    #[serde(default, rename = "peerDependencies")]
    pub peer_dependencies: BTreeMap<String, String>,
}

/// Trees and `resolved` URLs of a parsed lock file.
pub(crate) struct LockTrees {
    pub trees: Vec<GraphNode>,
    pub resolved: BTreeMap<String, String>,
}

struct LockWalker<'a> {
    lock: &'a PackageLock,
    scope: NpmScope,
    resolved: BTreeMap<String, String>,
}

impl<'a> LockWalker<'a> {
    /// Node module resolution: the closest `node_modules/<dep>` walking up
    /// from `from`.
    fn resolve(&self, from: &str, dep: &str) -> Option<String> {
        let mut base = from.to_string();
        loop {
            let candidate = if base.is_empty() {
                format!("node_modules/{}", dep)
            } else {
                format!("{}/node_modules/{}", base, dep)
            };
            if self.lock.packages.contains_key(&candidate) {
                return Some(candidate);
            }
            if base.is_empty() {
                return None;
            }
            base = match base.rfind("node_modules/") {
                Some(idx) => base[..idx].trim_end_matches('/').to_string(),
                None => String::new(),
            };
        }
    }

    /// Follows workspace links to the linked package location.
    fn target(&self, location: String) -> String {
        match self.lock.packages.get(&location) {
            Some(entry) if entry.link => entry.resolved.clone().unwrap_or(location),
            _ => location,
        }
    }

    fn name_of(&self, location: &str, entry: &LockEntry) -> String {
        if let Some(name) = &entry.name {
            return name.clone();
        }
        match location.rfind("node_modules/") {
            Some(idx) => location[idx + "node_modules/".len()..].to_string(),
            None => location.rsplit('/').next().unwrap_or(location).to_string(),
        }
    }

    fn id_of(&self, location: &str) -> Option<String> {
        let entry = self.lock.packages.get(location)?;
        let name = self.name_of(location, entry);
        Some(Technology::Npm.node_id(&name, entry.version.as_deref().unwrap_or_default()))
    }

    /// Direct dependency names of a root (the project or a workspace).
    fn root_dependencies(&self, entry: &LockEntry) -> Vec<String> {
        let mut names: Vec<&String> = Vec::new();
        if self.scope != NpmScope::DevOnly {
            names.extend(entry.dependencies.keys());
            names.extend(entry.optional_dependencies.keys());
            names.extend(entry.peer_dependencies.keys());
        }
        if self.scope != NpmScope::ProdOnly {
            names.extend(entry.dev_dependencies.keys());
        }
        let mut unique: Vec<String> = Vec::new();
        for name in names {
            if !unique.contains(name) {
                unique.push(name.clone());
            }
        }
        unique
    }

    fn transitive_dependencies(entry: &LockEntry) -> Vec<String> {
        entry
            .dependencies
            .keys()
            .chain(entry.optional_dependencies.keys())
            .chain(entry.peer_dependencies.keys())
            .cloned()
            .collect()
    }

    fn build_root(&mut self, location: &str, root_id: String) -> GraphNode {
        let lock = self.lock;
        let mut node = GraphNode::new(root_id.clone());
        let Some(entry) = lock.packages.get(location) else {
            return node;
        };
        let mut path = HashSet::from([root_id]);
        for dep in self.root_dependencies(entry) {
            if let Some(child) = self.build_dependency(location, &dep, &mut path) {
                node.nodes.push(child);
            }
        }
        node
    }

    fn build_dependency(&mut self, from: &str, dep: &str, path: &mut HashSet<String>) -> Option<GraphNode> {
        let Some(location) = self.resolve(from, dep) else {
            debug!(from = %from, dependency = %dep, "Dependency is not in the lock file, omitting it");
            return None;
        };
        let lock = self.lock;
        let location = self.target(location);
        let entry = lock.packages.get(&location)?;
        if self.scope == NpmScope::ProdOnly && entry.dev {
            return None;
        }
        let id = self.id_of(&location)?;
        if path.contains(&id) {
            return None;
        }
        if let Some(url) = entry.resolved.as_deref().filter(|u| u.starts_with("http")) {
            self.resolved.insert(id.clone(), url.to_string());
        }

        path.insert(id.clone());
        let mut node = GraphNode::new(id.clone());
        for child_dep in Self::transitive_dependencies(entry) {
            if let Some(child) = self.build_dependency(&location, &child_dep, path) {
                node.nodes.push(child);
            }
        }
        path.remove(&id);
        Some(node)
    }
}

/// One tree for the project, plus one per workspace no other tree reaches.
pub(crate) fn trees_from_lock(lock: &PackageLock, scope: NpmScope, fallback_name: &str) -> LockTrees {
    let mut walker = LockWalker {
        lock,
        scope,
        resolved: BTreeMap::new(),
    };

    let root_entry = lock.packages.get("");
    let root_name = root_entry
        .and_then(|e| e.name.clone())
        .or_else(|| lock.name.clone())
        .unwrap_or_else(|| fallback_name.to_string());
    let root_version = root_entry
        .and_then(|e| e.version.clone())
        .or_else(|| lock.version.clone())
        .unwrap_or_default();
    let root = walker.build_root("", Technology::Npm.node_id(&root_name, &root_version));

    let mut reached: HashSet<String> = HashSet::new();
    collect_ids(&root, &mut reached);
    let mut trees = vec![root];

    let workspaces: Vec<String> = lock
        .packages
        .iter()
        .filter(|(_, entry)| entry.link)
        .filter_map(|(_, entry)| entry.resolved.clone())
        .collect();
    for workspace in workspaces {
        let Some(id) = walker.id_of(&workspace) else { continue };
        if reached.contains(&id) {
            continue;
        }
        let tree = walker.build_root(&workspace, id);
        collect_ids(&tree, &mut reached);
        trees.push(tree);
    }

    LockTrees {
        trees,
        resolved: walker.resolved,
    }
}

fn collect_ids(node: &GraphNode, ids: &mut HashSet<String>) {
    ids.insert(node.id.clone());
    for child in &node.nodes {
        collect_ids(child, ids);
    }
}

pub(crate) fn parse_lock(content: &str, path: &Path) -> Result<PackageLock, TreeBuildError> {
    let lock: PackageLock = serde_json::from_str(content).map_err(|source| TreeBuildError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    if lock.lockfile_version < 2 {
        return Err(TreeBuildError::malformed(
            "npm",
            format!("lockfileVersion {} is not supported, run npm install with npm 7 or later", lock.lockfile_version),
        ));
    }
    Ok(lock)
}

/// Copies the manifest files into a scratch directory.
fn scratch_copy(ctx: &BuildContext, files: &[&str]) -> Result<tempfile::TempDir, TreeBuildError> {
    let scratch = tempfile::Builder::new()
        .prefix("depaudit-npm-")
        .tempdir()
        .map_err(|e| TreeBuildError::io(std::env::temp_dir(), e))?;
    for file in files {
        let source = ctx.path(file);
        if source.is_file() {
            let target = scratch.path().join(file);
            std::fs::copy(&source, &target).map_err(|e| TreeBuildError::io(&target, e))?;
        }
    }
    Ok(scratch)
}

#[async_trait]
impl TreeBuilder for NpmBuilder {
    async fn build_trees(&self, ctx: &BuildContext) -> Result<DependencyTrees, TreeBuildError> {
        if !ctx.path("package.json").is_file() {
            return Err(TreeBuildError::MissingDescriptor("package.json".to_string()));
        }

        let existing = LOCK_FILES.iter().map(|f| ctx.path(f)).find(|p| p.is_file());
        // curation must see the URLs the curated registry hands out
        let (lock_path, _scratch) = match existing {
            Some(path) if !ctx.is_curation() => (path, None),
            _ => {
                debug!("Generating package-lock.json in a scratch directory");
                let scratch = scratch_copy(ctx, &["package.json", ".npmrc"])?;
                let mut install = CommandInvocation::new("npm", scratch.path())
                    .args(["install", "--package-lock-only", "--ignore-scripts"]);
                if let Some(registry) = ctx.repository_url(NPM_REGISTRY_PATH) {
                    install = install.arg("--registry").arg(registry);
                }
                if let Some(curation) = &ctx.curation {
                    install = install.arg("--cache").arg(curation.cache_dir.to_string_lossy());
                }
                ctx.run(install).await?;
                (scratch.path().join("package-lock.json"), Some(scratch))
            }
        };

        let content = read_descriptor(&lock_path)?;
        let lock = parse_lock(&content, &lock_path)?;
        let parsed = trees_from_lock(&lock, ctx.npm_scope, &dir_name(&ctx.working_dir));
        let mut trees = DependencyTrees::from_trees(parsed.trees);
        if ctx.is_curation() {
            trees = trees.with_download_urls(parsed.resolved);
        }
        Ok(trees)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::testing::{ok, ScriptedRunner};
    use crate::technologies::CurationPaths;
    use std::sync::Arc;
    use tempfile::TempDir;

    const LOCK: &str = r#"{
  "name": "web",
  "version": "1.0.0",
  "lockfileVersion": 3,
  "packages": {
    "": {
      "name": "web",
      "version": "1.0.0",
      "dependencies": { "express": "^4.18.2", "debug": "^4.3.4" },
      "devDependencies": { "jest": "^29.0.0" }
    },
    "node_modules/express": {
      "version": "4.18.2",
      "resolved": "https://registry.npmjs.org/express/-/express-4.18.2.tgz",
      "dependencies": { "debug": "2.6.9" }
    },
    "node_modules/express/node_modules/debug": {
      "version": "2.6.9",
      "resolved": "https://registry.npmjs.org/debug/-/debug-2.6.9.tgz",
      "dependencies": { "ms": "2.0.0" }
    },
    "node_modules/debug": {
      "version": "4.3.4",
      "resolved": "https://registry.npmjs.org/debug/-/debug-4.3.4.tgz",
      "dependencies": { "ms": "2.1.2" }
    },
    "node_modules/ms": { "version": "2.1.2" },
    "node_modules/express/node_modules/ms": { "version": "2.0.0" },
    "node_modules/jest": { "version": "29.7.0", "dev": true }
  }
}"#;

    fn lock() -> PackageLock {
        parse_lock(LOCK, Path::new("package-lock.json")).unwrap()
    }

    #[test]
    fn test_nested_node_modules_resolution() {
        let parsed = trees_from_lock(&lock(), NpmScope::All, "web");
        assert_eq!(parsed.trees.len(), 1);
        let root = &parsed.trees[0];
        assert_eq!(root.id, "npm://web:1.0.0");
        let express = root.child("npm://express:4.18.2").unwrap();
        let nested_debug = express.child("npm://debug:2.6.9").unwrap();
        assert!(nested_debug.child("npm://ms:2.0.0").is_some());
        let debug = root.child("npm://debug:4.3.4").unwrap();
        assert!(debug.child("npm://ms:2.1.2").is_some());
        assert!(root.child("npm://jest:29.7.0").is_some());
        assert_eq!(parsed.resolved.len(), 3);
    }

    #[test]
    fn test_dependency_type_filter() {
        let prod = trees_from_lock(&lock(), NpmScope::ProdOnly, "web");
        assert!(prod.trees[0].child("npm://jest:29.7.0").is_none());
        assert!(prod.trees[0].child("npm://express:4.18.2").is_some());

        let dev = trees_from_lock(&lock(), NpmScope::DevOnly, "web");
        let ids: Vec<&str> = dev.trees[0].nodes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["npm://jest:29.7.0"]);
    }

    #[test]
    fn test_workspace_links_are_followed() {
        let content = r#"{
  "lockfileVersion": 3,
  "packages": {
    "": { "name": "mono", "version": "0.0.0", "dependencies": { "ui": "*" }, "workspaces": ["packages/*"] },
    "node_modules/ui": { "resolved": "packages/ui", "link": true },
    "node_modules/tools": { "resolved": "packages/tools", "link": true },
    "packages/ui": { "name": "ui", "version": "1.0.0", "dependencies": { "left-pad": "^1.3.0" } },
    "packages/tools": { "name": "tools", "version": "2.0.0", "dependencies": { "left-pad": "^1.3.0" } },
    "node_modules/left-pad": { "version": "1.3.0" }
  }
}"#;
        let lock = parse_lock(content, Path::new("package-lock.json")).unwrap();
        let parsed = trees_from_lock(&lock, NpmScope::All, "mono");
        assert_eq!(parsed.trees.len(), 2);
        let ui = parsed.trees[0].child("npm://ui:1.0.0").unwrap();
        assert!(ui.child("npm://left-pad:1.3.0").is_some());
        assert_eq!(parsed.trees[1].id, "npm://tools:2.0.0");
        assert!(parsed.trees[1].child("npm://left-pad:1.3.0").is_some());
    }

    #[test]
    fn test_lockfile_v1_is_rejected() {
        let err = parse_lock(r#"{"lockfileVersion": 1, "dependencies": {}}"#, Path::new("l")).unwrap_err();
        assert!(matches!(err, TreeBuildError::Malformed { .. }));
    }

    #[tokio::test]
    async fn test_missing_lock_is_generated_in_scratch_copy() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("package.json"), r#"{"name": "web", "version": "1.0.0"}"#).unwrap();
        let runner = Arc::new(ScriptedRunner::new().on(
            |inv| inv.program == "npm",
            |inv| {
                std::fs::write(inv.current_dir.join("package-lock.json"), LOCK).unwrap();
                ok("")
            },
        ));
        let ctx = BuildContext::new(Technology::Npm, dir.path(), runner.clone());
        let deps = NpmBuilder.build_trees(&ctx).await.unwrap();

        assert!(deps.unique.contains("npm://ms:2.0.0"));
        assert!(!dir.path().join("package-lock.json").exists());
        let call = &runner.recorded()[0];
        assert_ne!(call.current_dir, dir.path());
        assert_eq!(call.args, vec!["install", "--package-lock-only", "--ignore-scripts"]);
        assert!(deps.download_urls.is_empty());
    }

    #[tokio::test]
    async fn test_curation_collects_resolved_urls() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("package.json"), "{}").unwrap();
        std::fs::write(dir.path().join("package-lock.json"), LOCK).unwrap();
        let runner = Arc::new(ScriptedRunner::new().on(
            |inv| inv.program == "npm",
            |inv| {
                std::fs::write(inv.current_dir.join("package-lock.json"), LOCK).unwrap();
                ok("")
            },
        ));
        let mut ctx = BuildContext::new(Technology::Npm, dir.path(), runner.clone());
        ctx.curation = Some(CurationPaths {
            cache_dir: dir.path().join("cache"),
            pip_cache_dir: dir.path().join("pip"),
        });
        let deps = NpmBuilder.build_trees(&ctx).await.unwrap();
        assert_eq!(runner.recorded().len(), 1);
        assert_eq!(
            deps.download_urls["npm://express:4.18.2"],
            "https://registry.npmjs.org/express/-/express-4.18.2.tgz"
        );
        assert!(runner.recorded()[0].args.contains(&"--cache".to_string()));
    }
}
