//! Ecosystem adapters.
//!
//! Every technology implements [`TreeBuilder`]: given a [`BuildContext`] it
//! produces the full dependency trees of one working directory. The unique
//! dependency set is always derived from those trees, so the two cannot
//! disagree.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::command::{CommandInvocation, CommandOutput, CommandRunner};
use crate::config::NpmScope;
use crate::error::{CommandError, TreeBuildError};
use crate::graph::{collect_unique_ids, collect_unique_types, GraphNode, UniqueDependencies};
use crate::models::Technology;
use crate::resolver::Resolution;

pub mod go;
pub mod java;
pub mod npm;
pub mod nuget;
pub mod python;
pub mod yarn;

/// Curation mode locations for one pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurationPaths {
    /// Per project and technology, from [`crate::curation::CurationSettings::cache_dir_for`].
    pub cache_dir: PathBuf,
    /// Shared pip download cache.
    pub pip_cache_dir: PathBuf,
}

/// Everything an adapter may read while building trees. Owned by one pair.
#[derive(Clone)]
pub struct BuildContext {
    pub technology: Technology,
    /// Absolute directory every tool invocation runs in.
    pub working_dir: PathBuf,
    pub descriptors: Vec<PathBuf>,
    pub resolution: Resolution,
    /// Explicit pip requirements file, relative to `working_dir`.
    pub requirements_file: Option<String>,
    pub npm_scope: NpmScope,
    /// Prefer `./mvnw` and `./gradlew`.
    pub use_wrapper: bool,
    /// `Some` in curation mode.
    pub curation: Option<CurationPaths>,
    pub runner: Arc<dyn CommandRunner>,
}

impl std::fmt::Debug for BuildContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildContext")
            .field("technology", &self.technology)
            .field("working_dir", &self.working_dir)
            .field("descriptors", &self.descriptors)
            .field("repository", &self.resolution.repository)
            .field("curation", &self.curation.is_some())
            .finish()
    }
}

impl BuildContext {
    pub fn new(technology: Technology, working_dir: impl Into<PathBuf>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            technology,
            working_dir: working_dir.into(),
            descriptors: Vec::new(),
            resolution: Resolution::default(),
            requirements_file: None,
            npm_scope: NpmScope::All,
            use_wrapper: false,
            curation: None,
            runner,
        }
    }

    pub fn is_curation(&self) -> bool {
        self.curation.is_some()
    }

    /// An invocation of `program` in the working directory.
    pub fn command(&self, program: impl Into<String>) -> CommandInvocation {
        CommandInvocation::new(program, &self.working_dir)
    }

    pub async fn run(&self, invocation: CommandInvocation) -> Result<CommandOutput, CommandError> {
        self.runner.run(&invocation).await
    }

    pub fn path(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.working_dir.join(relative)
    }

    /// URL of the resolution repository's `api_path` endpoint, with the
    /// server credentials embedded. `None` without a resolution repository.
    ///
    /// `api_path` may contain `{repo}`, replaced by the repository name.
    pub fn repository_url(&self, api_path: &str) -> Option<String> {
        let repo = self.resolution.repository.as_deref()?;
        let server = self.resolution.server.as_ref()?;
        let raw = format!("{}{}", server.artifactory_url(), api_path.replace("{repo}", repo));
        let Ok(mut url) = reqwest::Url::parse(&raw) else {
            return Some(raw);
        };
        if let Some((user, secret)) = server.credentials() {
            let user = if user.is_empty() { "token" } else { user.as_str() };
            if url.set_username(user).is_ok() {
                let _ = url.set_password(Some(&secret));
            }
        }
        Some(url.to_string())
    }

    /// Same as [`repository_url`](Self::repository_url) without credentials,
    /// for values that end up in reports.
    pub fn public_repository_url(&self, api_path: &str) -> Option<String> {
        let repo = self.resolution.repository.as_deref()?;
        let server = self.resolution.server.as_ref()?;
        Some(format!("{}{}", server.artifactory_url(), api_path.replace("{repo}", repo)))
    }
}

/// The trees of one working directory, plus what was derived from them.
#[derive(Debug, Clone, PartialEq)]
pub struct DependencyTrees {
    pub trees: Vec<GraphNode>,
    pub unique: UniqueDependencies,
    /// Dependency id → download URL; only filled in curation mode.
    pub download_urls: BTreeMap<String, String>,
}

impl DependencyTrees {
    pub fn from_trees(trees: Vec<GraphNode>) -> Self {
        let unique = UniqueDependencies::Ids(collect_unique_ids(&trees));
        Self {
            trees,
            unique,
            download_urls: BTreeMap::new(),
        }
    }

    /// For ecosystems whose nodes carry type tags.
    pub fn from_typed_trees(trees: Vec<GraphNode>) -> Self {
        let unique = UniqueDependencies::Typed(collect_unique_types(&trees));
        Self {
            trees,
            unique,
            download_urls: BTreeMap::new(),
        }
    }

    /// Keeps only URLs of dependencies that are part of the trees.
    pub fn with_download_urls(mut self, urls: BTreeMap<String, String>) -> Self {
        self.download_urls = urls
            .into_iter()
            .filter(|(id, _)| self.unique.contains(id))
            .collect();
        self
    }

    /// Total number of nodes below the tree roots.
    pub fn node_count(&self) -> usize {
        self.trees.iter().map(GraphNode::descendant_count).sum()
    }
}

#[async_trait]
pub trait TreeBuilder: Send + Sync {
    async fn build_trees(&self, ctx: &BuildContext) -> Result<DependencyTrees, TreeBuildError>;
}

/// Technology → adapter.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    builders: HashMap<Technology, Arc<dyn TreeBuilder>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// One adapter for every supported technology.
    pub fn with_defaults() -> Self {
        let nuget: Arc<dyn TreeBuilder> = Arc::new(nuget::NugetBuilder);
        Self::new()
            .register(Technology::Maven, Arc::new(java::MavenBuilder))
            .register(Technology::Gradle, Arc::new(java::GradleBuilder))
            .register(Technology::Npm, Arc::new(npm::NpmBuilder))
            .register(Technology::Yarn, Arc::new(yarn::YarnBuilder))
            .register(Technology::Go, Arc::new(go::GoBuilder))
            .register(Technology::Pip, Arc::new(python::PipBuilder))
            .register(Technology::Pipenv, Arc::new(python::PipenvBuilder))
            .register(Technology::Poetry, Arc::new(python::PoetryBuilder))
            .register(Technology::Nuget, nuget.clone())
            .register(Technology::Dotnet, nuget)
    }

    pub fn register(mut self, technology: Technology, builder: Arc<dyn TreeBuilder>) -> Self {
        self.builders.insert(technology, builder);
        self
    }

    pub fn get(&self, technology: Technology) -> Option<Arc<dyn TreeBuilder>> {
        self.builders.get(&technology).cloned()
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut techs: Vec<_> = self.builders.keys().collect();
        techs.sort();
        f.debug_struct("AdapterRegistry").field("technologies", &techs).finish()
    }
}

/// Read a file adapters cannot work without.
pub(crate) fn read_descriptor(path: &Path) -> Result<String, TreeBuildError> {
    std::fs::read_to_string(path).map_err(|e| TreeBuildError::io(path, e))
}

/// Last path component, used to name synthetic project roots.
pub(crate) fn dir_name(dir: &Path) -> String {
    dir.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "root".to_string())
}
