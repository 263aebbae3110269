use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::command::CommandInvocation;
use crate::error::TreeBuildError;
use crate::graph::GraphNode;
use crate::models::Technology;

use super::{dir_name, read_descriptor, BuildContext, DependencyTrees, TreeBuilder};

const DEFAULT_REGISTRY: &str = "https://registry.yarnpkg.com";
const NPM_REGISTRY_PATH: &str = "api/npm/{repo}";

/// Reads `yarn.lock` in either the classic (v1) or the Berry (YAML) format.
pub struct YarnBuilder;

/// One resolved package of a lock file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct YarnPackage {
    pub name: String,
    pub version: String,
    /// Classic `resolved` URL or Berry `resolution` locator.
    pub resolved: Option<String>,
    pub dependencies: Vec<(String, String)>,
}

/// Descriptor (`name@range`) → package.
#[derive(Debug, Default)]
pub(crate) struct YarnLock {
    pub berry: bool,
    pub entries: BTreeMap<String, YarnPackage>,
}

/// `@scope/name@range` → (`@scope/name`, `range`).
fn split_descriptor(descriptor: &str) -> Option<(&str, &str)> {
    let at = descriptor.get(1..)?.find('@')? + 1;
    Some((&descriptor[..at], &descriptor[at + 1..]))
}

fn unquote(value: &str) -> &str {
    value.trim().trim_matches('"')
}

pub(crate) fn parse_classic_lock(content: &str) -> YarnLock {
    let mut lock = YarnLock::default();
    let mut descriptors: Vec<String> = Vec::new();
    let mut current = YarnPackage::default();
    let mut in_dependencies = false;

    let flush = |descriptors: &mut Vec<String>, current: &mut YarnPackage, lock: &mut YarnLock| {
        if !descriptors.is_empty() && !current.version.is_empty() {
            for descriptor in descriptors.iter() {
                lock.entries.insert(descriptor.clone(), current.clone());
            }
        }
        descriptors.clear();
        *current = YarnPackage::default();
    };

    for line in content.lines() {
        if line.trim().is_empty() || line.trim_start().starts_with('#') {
            continue;
        }
        let indent = line.len() - line.trim_start().len();
        let trimmed = line.trim();
        if indent == 0 {
            flush(&mut descriptors, &mut current, &mut lock);
            in_dependencies = false;
            for descriptor in trimmed.trim_end_matches(':').split(", ") {
                let descriptor = unquote(descriptor);
                if let Some((name, _)) = split_descriptor(descriptor) {
                    current.name = name.to_string();
                    descriptors.push(descriptor.to_string());
                }
            }
        } else if indent <= 2 {
            in_dependencies = trimmed == "dependencies:" || trimmed == "optionalDependencies:";
            if let Some(version) = trimmed.strip_prefix("version ") {
                current.version = unquote(version).to_string();
            } else if let Some(resolved) = trimmed.strip_prefix("resolved ") {
                let url = unquote(resolved);
                let url = url.split('#').next().unwrap_or(url);
                current.resolved = Some(url.to_string());
            }
        } else if in_dependencies {
            // `"@scope/name" "^1.0.0"` or `name "^1.0.0"`
            let (name, range) = if let Some(rest) = trimmed.strip_prefix('"') {
                match rest.split_once('"') {
                    Some((name, range)) => (name, unquote(range)),
                    None => continue,
                }
            } else {
                match trimmed.split_once(' ') {
                    Some((name, range)) => (name, unquote(range)),
                    None => continue,
                }
            };
            current.dependencies.push((name.to_string(), range.to_string()));
        }
    }
    flush(&mut descriptors, &mut current, &mut lock);
    lock
}

#[derive(Debug, Deserialize)]
struct BerryEntry {
    #[serde(default)]
    version: Option<serde_yaml::Value>,
    #[serde(default)]
    resolution: Option<String>,
    #[serde(default)]
    dependencies: BTreeMap<String, serde_yaml::Value>,
    #[serde(default, rename = "optionalDependencies")]
    optional_dependencies: BTreeMap<String, serde_yaml::Value>,
}

fn yaml_scalar(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::String(s) => s.clone(),
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        _ => String::new(),
    }
}

pub(crate) fn parse_berry_lock(content: &str, path: &Path) -> Result<YarnLock, TreeBuildError> {
    let raw: BTreeMap<String, serde_yaml::Value> =
        serde_yaml::from_str(content).map_err(|source| TreeBuildError::Yaml {
            path: path.to_path_buf(),
            source,
        })?;
    let mut lock = YarnLock {
        berry: true,
        entries: BTreeMap::new(),
    };
    for (key, value) in raw {
        if key == "__metadata" {
            continue;
        }
        let entry: BerryEntry = match serde_yaml::from_value(value) {
            Ok(entry) => entry,
            Err(e) => {
                debug!(descriptor = %key, error = %e, "Skipping unreadable yarn.lock entry");
                continue;
            }
        };
        let dependencies = entry
            .dependencies
            .iter()
            .chain(entry.optional_dependencies.iter())
            .map(|(name, range)| (name.clone(), yaml_scalar(range)))
            .collect::<Vec<_>>();
        let version = entry.version.as_ref().map(yaml_scalar).unwrap_or_default();
        for descriptor in key.split(", ") {
            let descriptor = unquote(descriptor);
            let Some((name, _)) = split_descriptor(descriptor) else { continue };
            lock.entries.insert(
                descriptor.to_string(),
                YarnPackage {
                    name: name.to_string(),
                    version: version.clone(),
                    resolved: entry.resolution.clone(),
                    dependencies: dependencies.clone(),
                },
            );
        }
    }
    Ok(lock)
}

impl YarnLock {
    fn find(&self, name: &str, range: &str) -> Option<&YarnPackage> {
        self.entries
            .get(&format!("{}@{}", name, range))
            .or_else(|| self.entries.get(&format!("{}@npm:{}", name, range)))
            .or_else(|| self.entries.values().find(|p| p.name == name))
    }
}

/// Direct dependencies and identity of the project from `package.json`.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct PackageJson {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default, rename = "devDependencies")]
    pub dev_dependencies: BTreeMap<String, String>,
    #[serde(default, rename = "optionalDependencies")]
    pub optional_dependencies: BTreeMap<String, String>,
}

struct YarnWalker<'a> {
    lock: &'a YarnLock,
    registry: String,
    urls: BTreeMap<String, String>,
}

impl<'a> YarnWalker<'a> {
    fn download_url(&self, package: &YarnPackage) -> Option<String> {
        let resolved = package.resolved.as_deref()?;
        if resolved.starts_with("http") {
            return Some(resolved.to_string());
        }
        if !self.lock.berry || !resolved.contains("@npm:") {
            return None;
        }
        let base = package.name.rsplit('/').next().unwrap_or(&package.name);
        Some(format!(
            "{}/{}/-/{}-{}.tgz",
            self.registry.trim_end_matches('/'),
            package.name,
            base,
            package.version
        ))
    }

    fn build(&mut self, name: &str, range: &str, path: &mut HashSet<String>) -> Option<GraphNode> {
        let lock = self.lock;
        let Some(package) = lock.find(name, range) else {
            debug!(dependency = %name, range = %range, "Dependency is not in yarn.lock, omitting it");
            return None;
        };
        let id = Technology::Yarn.node_id(&package.name, &package.version);
        if path.contains(&id) {
            return None;
        }
        if let Some(url) = self.download_url(package) {
            self.urls.insert(id.clone(), url);
        }
        path.insert(id.clone());
        let mut node = GraphNode::new(id.clone());
        for (child_name, child_range) in &package.dependencies {
            if let Some(child) = self.build(child_name, child_range, path) {
                node.nodes.push(child);
            }
        }
        path.remove(&id);
        Some(node)
    }
}

pub(crate) fn tree_from_lock(
    manifest: &PackageJson,
    lock: &YarnLock,
    fallback_name: &str,
    registry: &str,
) -> (GraphNode, BTreeMap<String, String>) {
    let name = manifest.name.clone().unwrap_or_else(|| fallback_name.to_string());
    let root_id = Technology::Yarn.node_id(&name, manifest.version.as_deref().unwrap_or_default());
    let mut walker = YarnWalker {
        lock,
        registry: registry.to_string(),
        urls: BTreeMap::new(),
    };
    let mut root = GraphNode::new(root_id.clone());
    let mut path = HashSet::from([root_id]);
    let direct = manifest
        .dependencies
        .iter()
        .chain(manifest.optional_dependencies.iter())
        .chain(manifest.dev_dependencies.iter());
    for (dep, range) in direct {
        if let Some(child) = walker.build(dep, range, &mut path) {
            root.nodes.push(child);
        }
    }
    (root, walker.urls)
}

pub(crate) fn parse_lock(content: &str, path: &Path) -> Result<YarnLock, TreeBuildError> {
    if content.contains("__metadata:") {
        parse_berry_lock(content, path)
    } else {
        Ok(parse_classic_lock(content))
    }
}

#[async_trait]
impl TreeBuilder for YarnBuilder {
    async fn build_trees(&self, ctx: &BuildContext) -> Result<DependencyTrees, TreeBuildError> {
        let manifest_path = ctx.path("package.json");
        if !manifest_path.is_file() {
            return Err(TreeBuildError::MissingDescriptor("package.json".to_string()));
        }
        let manifest: PackageJson =
            serde_json::from_str(&read_descriptor(&manifest_path)?).map_err(|source| TreeBuildError::Json {
                path: manifest_path.clone(),
                source,
            })?;

        let registry_url = ctx.repository_url(NPM_REGISTRY_PATH);
        let berry = ctx.path(".yarnrc.yml").is_file();
        let lock_path = ctx.path("yarn.lock");
        let (lock_path, _scratch) = if lock_path.is_file() {
            (lock_path, None)
        } else {
            debug!("yarn.lock not found, generating it in a scratch directory");
            let scratch = tempfile::Builder::new()
                .prefix("depaudit-yarn-")
                .tempdir()
                .map_err(|e| TreeBuildError::io(std::env::temp_dir(), e))?;
            for file in ["package.json", ".yarnrc.yml", ".yarnrc", ".npmrc"] {
                let source = ctx.path(file);
                if source.is_file() {
                    let target = scratch.path().join(file);
                    std::fs::copy(&source, &target).map_err(|e| TreeBuildError::io(&target, e))?;
                }
            }
            let mut install = CommandInvocation::new("yarn", scratch.path()).arg("install");
            install = if berry {
                install.arg("--mode=update-lockfile")
            } else {
                install.arg("--ignore-scripts")
            };
            if let Some(registry) = &registry_url {
                install = if berry {
                    install.env("YARN_NPM_REGISTRY_SERVER", registry.clone())
                } else {
                    install.arg("--registry").arg(registry.clone())
                };
            }
            ctx.run(install).await?;
            (scratch.path().join("yarn.lock"), Some(scratch))
        };

        let content = read_descriptor(&lock_path)?;
        let lock = parse_lock(&content, &lock_path)?;
        let registry = ctx
            .public_repository_url(NPM_REGISTRY_PATH)
            .unwrap_or_else(|| DEFAULT_REGISTRY.to_string());
        let (tree, urls) = tree_from_lock(&manifest, &lock, &dir_name(&ctx.working_dir), &registry);

        let mut trees = DependencyTrees::from_trees(vec![tree]);
        if ctx.is_curation() {
            trees = trees.with_download_urls(urls);
        }
        Ok(trees)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::testing::{ok, ScriptedRunner};
    use std::sync::Arc;
    use tempfile::TempDir;

    const CLASSIC: &str = r#"# THIS IS AN AUTOGENERATED FILE. DO NOT EDIT THIS FILE DIRECTLY.
# yarn lockfile v1


"@babel/highlight@^7.10.4":
  version "7.22.20"
  resolved "https://registry.yarnpkg.com/@babel/highlight/-/highlight-7.22.20.tgz#4ca92b"
  dependencies:
    chalk "^2.4.2"

chalk@^2.0.0, chalk@^2.4.2:
  version "2.4.2"
  resolved "https://registry.yarnpkg.com/chalk/-/chalk-2.4.2.tgz#cd42541"
  dependencies:
    ansi-styles "^3.2.1"

ansi-styles@^3.2.1:
  version "3.2.1"
  resolved "https://registry.yarnpkg.com/ansi-styles/-/ansi-styles-3.2.1.tgz#41fbb20"
"#;

    const BERRY: &str = r#"__metadata:
  version: 6
  cacheKey: 8

"ansi-styles@npm:^3.2.1":
  version: 3.2.1
  resolution: "ansi-styles@npm:3.2.1"
  languageName: node
  linkType: hard

"chalk@npm:^2.0.0, chalk@npm:^2.4.2":
  version: 2.4.2
  resolution: "chalk@npm:2.4.2"
  dependencies:
    ansi-styles: ^3.2.1
  languageName: node
  linkType: hard

"web@workspace:.":
  version: 0.0.0-use.local
  resolution: "web@workspace:."
  dependencies:
    chalk: ^2.0.0
  languageName: unknown
  linkType: soft
"#;

    fn manifest(deps: &[(&str, &str)]) -> PackageJson {
        PackageJson {
            name: Some("web".into()),
            version: Some("1.0.0".into()),
            dependencies: deps.iter().map(|(n, r)| (n.to_string(), r.to_string())).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_classic_lock() {
        let lock = parse_classic_lock(CLASSIC);
        assert_eq!(lock.entries.len(), 4);
        assert_eq!(lock.entries["chalk@^2.0.0"].version, "2.4.2");
        assert_eq!(
            lock.entries["@babel/highlight@^7.10.4"].resolved.as_deref(),
            Some("https://registry.yarnpkg.com/@babel/highlight/-/highlight-7.22.20.tgz")
        );

        let (tree, urls) = tree_from_lock(
            &manifest(&[("@babel/highlight", "^7.10.4"), ("chalk", "^2.0.0")]),
            &lock,
            "web",
            DEFAULT_REGISTRY,
        );
        assert_eq!(tree.id, "npm://web:1.0.0");
        let highlight = tree.child("npm://@babel/highlight:7.22.20").unwrap();
        let chalk = highlight.child("npm://chalk:2.4.2").unwrap();
        assert!(chalk.child("npm://ansi-styles:3.2.1").is_some());
        assert!(tree.child("npm://chalk:2.4.2").is_some());
        assert_eq!(urls.len(), 3);
    }

    #[test]
    fn test_berry_lock() {
        let lock = parse_berry_lock(BERRY, Path::new("yarn.lock")).unwrap();
        assert!(lock.berry);
        let (tree, urls) = tree_from_lock(&manifest(&[("chalk", "^2.0.0")]), &lock, "web", DEFAULT_REGISTRY);
        let chalk = tree.child("npm://chalk:2.4.2").unwrap();
        assert!(chalk.child("npm://ansi-styles:3.2.1").is_some());
        assert_eq!(
            urls["npm://chalk:2.4.2"],
            "https://registry.yarnpkg.com/chalk/-/chalk-2.4.2.tgz"
        );
    }

    #[test]
    fn test_split_scoped_descriptor() {
        assert_eq!(split_descriptor("@babel/core@^7.0.0"), Some(("@babel/core", "^7.0.0")));
        assert_eq!(split_descriptor("chalk@npm:^2.0.0"), Some(("chalk", "npm:^2.0.0")));
        assert_eq!(split_descriptor("nothing"), None);
    }

    #[tokio::test]
    async fn test_missing_lock_is_generated() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("package.json"),
            r#"{"name": "web", "version": "1.0.0", "dependencies": {"chalk": "^2.0.0"}}"#,
        )
        .unwrap();
        let runner = Arc::new(ScriptedRunner::new().on(
            |inv| inv.program == "yarn",
            |inv| {
                std::fs::write(inv.current_dir.join("yarn.lock"), CLASSIC).unwrap();
                ok("")
            },
        ));
        let ctx = BuildContext::new(Technology::Yarn, dir.path(), runner.clone());
        let deps = YarnBuilder.build_trees(&ctx).await.unwrap();
        assert!(deps.unique.contains("npm://ansi-styles:3.2.1"));
        assert!(!dir.path().join("yarn.lock").exists());
        assert_eq!(runner.recorded()[0].args, vec!["install", "--ignore-scripts"]);
    }
}
