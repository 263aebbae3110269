use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::TreeBuildError;
use crate::graph::{expand_tree, Edges, GraphNode};
use crate::models::Technology;

use super::{dir_name, read_descriptor, BuildContext, DependencyTrees, TreeBuilder};

const PROJECT_EXTENSIONS: &[&str] = &["csproj", "fsproj", "vbproj"];
const ASSETS_FILE: &str = "obj/project.assets.json";
const NUGET_SOURCE_PATH: &str = "api/nuget/v3/{repo}/index.json";
const NUGET_FLAT_CONTAINER_PATH: &str = "api/nuget/v3/{repo}/flatcontainer";
const PUBLIC_FLAT_CONTAINER: &str = "https://api.nuget.org/v3-flatcontainer";

#[derive(Debug, Deserialize)]
pub(crate) struct AssetsFile {
    #[serde(default)]
    targets: BTreeMap<String, BTreeMap<String, TargetEntry>>,
    project: AssetsProject,
}

#[derive(Debug, Deserialize)]
struct TargetEntry {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    dependencies: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct AssetsProject {
    #[serde(default)]
    version: String,
    restore: RestoreInfo,
    #[serde(default)]
    frameworks: BTreeMap<String, Framework>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RestoreInfo {
    project_name: String,
}

#[derive(Debug, Deserialize)]
struct Framework {
    #[serde(default)]
    dependencies: BTreeMap<String, FrameworkDependency>,
}

#[derive(Debug, Deserialize)]
struct FrameworkDependency {
    #[serde(default)]
    target: String,
}

/// A restored package, as it appears in the assets file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Package {
    pub name: String,
    pub version: String,
}

impl Package {
    fn id(&self) -> String {
        Technology::Nuget.node_id(&self.name, &self.version)
    }
}

/// Build the tree of one restored project. Dependency ranges are resolved
/// against the packages restored for the project (names are case
/// insensitive); project references are transparent.
pub(crate) fn tree_from_assets(assets: &AssetsFile) -> (GraphNode, Vec<Package>) {
    let root_id = Technology::Nuget.node_id(&assets.project.restore.project_name, &assets.project.version);

    let mut restored: BTreeMap<String, Package> = BTreeMap::new();
    for entries in assets.targets.values() {
        for (key, entry) in entries {
            let Some((name, version)) = key.split_once('/') else {
                continue;
            };
            if entry.kind == "package" {
                restored.entry(name.to_lowercase()).or_insert_with(|| Package {
                    name: name.to_string(),
                    version: version.to_string(),
                });
            }
        }
    }
    let lookup = |name: &str| restored.get(&name.to_lowercase());

    let mut edges = Edges::new();
    let mut direct: Vec<String> = Vec::new();
    let push_direct = |name: &str, direct: &mut Vec<String>| {
        if let Some(package) = lookup(name) {
            let id = package.id();
            if !direct.contains(&id) {
                direct.push(id);
            }
        }
    };
    for framework in assets.project.frameworks.values() {
        for (name, dependency) in &framework.dependencies {
            if dependency.target.is_empty() || dependency.target.eq_ignore_ascii_case("package") {
                push_direct(name, &mut direct);
            }
        }
    }
    for entries in assets.targets.values() {
        for (key, entry) in entries {
            let Some((name, _)) = key.split_once('/') else {
                continue;
            };
            match entry.kind.as_str() {
                "project" => {
                    for dependency in entry.dependencies.keys() {
                        push_direct(dependency, &mut direct);
                    }
                }
                "package" => {
                    let Some(parent) = lookup(name) else { continue };
                    let children = edges.entry(parent.id()).or_default();
                    for dependency in entry.dependencies.keys() {
                        match lookup(dependency) {
                            Some(child) if !children.contains(&child.id()) => children.push(child.id()),
                            Some(_) => {}
                            None => debug!(package = %name, dependency = %dependency, "Dependency was not restored"),
                        }
                    }
                }
                _ => {}
            }
        }
    }
    edges.insert(root_id.clone(), direct);

    let tree = expand_tree(&root_id, &edges, &BTreeMap::new());
    (tree, restored.into_values().collect())
}

/// Parse `<package id="..." version="..." />` entries from `packages.config`.
pub(crate) fn parse_packages_config(content: &str) -> Vec<Package> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut packages = Vec::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Empty(ref e)) | Ok(Event::Start(ref e)) => {
                let tag = String::from_utf8_lossy(e.name().local_name().as_ref()).into_owned();
                if tag == "package" {
                    let mut id = String::new();
                    let mut version = String::new();
                    for attr in e.attributes().flatten() {
                        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
                        let val = attr.unescape_value().unwrap_or_default().into_owned();
                        match key.as_str() {
                            "id" => id = val,
                            "version" => version = val,
                            _ => {}
                        }
                    }
                    if !id.is_empty() {
                        packages.push(Package { name: id, version });
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                warn!("Stopped reading packages.config: {}", e);
                break;
            }
            _ => {}
        }
        buf.clear();
    }

    packages
}

fn project_files(ctx: &BuildContext) -> Result<Vec<PathBuf>, TreeBuildError> {
    let is_project = |p: &Path| {
        p.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| PROJECT_EXTENSIONS.contains(&e))
    };
    let mut projects: Vec<PathBuf> = ctx.descriptors.iter().filter(|p| is_project(p)).cloned().collect();
    if projects.is_empty() {
        let entries = std::fs::read_dir(&ctx.working_dir).map_err(|e| TreeBuildError::io(&ctx.working_dir, e))?;
        projects = entries.flatten().map(|e| e.path()).filter(|p| is_project(p)).collect();
    }
    projects.sort();
    Ok(projects)
}

fn assets_path(project: &Path) -> PathBuf {
    project.parent().unwrap_or(Path::new(".")).join(ASSETS_FILE)
}

fn read_assets(path: &Path) -> Result<AssetsFile, TreeBuildError> {
    let content = read_descriptor(path)?;
    serde_json::from_str(&content).map_err(|source| TreeBuildError::Json {
        path: path.to_path_buf(),
        source,
    })
}

fn package_url(base: &str, package: &Package) -> String {
    let name = package.name.to_lowercase();
    let version = package.version.to_lowercase();
    format!("{}/{name}/{version}/{name}.{version}.nupkg", base.trim_end_matches('/'))
}

/// Reads `project.assets.json` of every project, restoring first when any is
/// missing. Falls back to `packages.config` for legacy projects.
pub struct NugetBuilder;

#[async_trait]
impl TreeBuilder for NugetBuilder {
    async fn build_trees(&self, ctx: &BuildContext) -> Result<DependencyTrees, TreeBuildError> {
        let projects = project_files(ctx)?;
        let packages_config = ctx.path("packages.config");
        if projects.is_empty() && !packages_config.is_file() {
            return Err(TreeBuildError::MissingDescriptor("project file".to_string()));
        }

        let needs_restore = ctx.is_curation() || projects.iter().any(|p| !assets_path(p).is_file());
        if !projects.is_empty() && needs_restore {
            let mut restore = ctx.command("dotnet").arg("restore");
            if let Some(source) = ctx.repository_url(NUGET_SOURCE_PATH) {
                restore = restore.arg("--source").arg(source);
            }
            if let Some(curation) = &ctx.curation {
                restore = restore
                    .arg("--packages")
                    .arg(curation.cache_dir.to_string_lossy())
                    .arg("--force");
            }
            ctx.run(restore).await?;
        }

        let mut trees = Vec::new();
        let mut packages: Vec<Package> = Vec::new();
        for project in &projects {
            let (tree, restored) = tree_from_assets(&read_assets(&assets_path(project))?);
            debug!(project = %project.display(), dependencies = tree.descendant_count(), "Read restored project");
            trees.push(tree);
            packages.extend(restored);
        }
        if projects.is_empty() {
            let legacy = parse_packages_config(&read_descriptor(&packages_config)?);
            let root = Technology::Nuget.node_id(&dir_name(&ctx.working_dir), "");
            trees.push(GraphNode::with_children(
                root,
                legacy.iter().map(|p| GraphNode::new(p.id())).collect(),
            ));
            packages = legacy;
        }

        let mut deps = DependencyTrees::from_trees(trees);
        if ctx.is_curation() {
            let base = ctx
                .public_repository_url(NUGET_FLAT_CONTAINER_PATH)
                .unwrap_or_else(|| PUBLIC_FLAT_CONTAINER.to_string());
            let urls = packages.iter().map(|p| (p.id(), package_url(&base, p))).collect();
            deps = deps.with_download_urls(urls);
        }
        Ok(deps)
    }
}
