//! Per-technology resolution repository lookup.
//!
//! A project may pin the registry a technology resolves against with a file
//! `.depaudit/projects/<tech>.yaml`:
//!
//! ```yaml
//! version: 1
//! type: pip
//! resolver:
//!   repo: pypi-remote
//!   serverId: acme
//! ```
//!
//! The lookup never mutates [`AuditParams`]. It returns a [`Resolution`]
//! that the orchestrator threads into the tree build of one pair.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use crate::config::{AuditParams, ServerDetails};
use crate::error::ResolverError;
use crate::models::Technology;

const CONFIG_DIR: &str = ".depaudit";
const PROJECTS_DIR: &str = "projects";

/// Resolution target for one (technology, working directory) pair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    /// Server hosting `repository`; the default server when no config applies.
    pub server: Option<ServerDetails>,
    /// `None` resolves against the ecosystem's public registry.
    pub repository: Option<String>,
    /// The config file the values came from.
    pub source: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct ProjectConfig {
    #[serde(default)]
    resolver: Option<ResolverSection>,
}

#[derive(Debug, Deserialize)]
struct ResolverSection {
    #[serde(default)]
    repo: String,
    #[serde(default, rename = "serverId")]
    server_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RepositoryResolver {
    /// Searched after the working directory and its ancestors, as
    /// `<global_dir>/projects/<tech>.yaml`.
    global_dir: Option<PathBuf>,
}

impl RepositoryResolver {
    pub fn new(global_dir: Option<PathBuf>) -> Self {
        Self { global_dir }
    }

    pub fn resolve(
        &self,
        technology: Technology,
        working_dir: &Path,
        params: &AuditParams,
    ) -> Result<Resolution, ResolverError> {
        let default = Resolution {
            server: params.server.clone(),
            repository: params.deps_repo.clone(),
            source: None,
        };
        if params.deps_repo.is_some() || params.ignore_config_file {
            return Ok(default);
        }

        let found = self.find_config(technology, working_dir).or_else(|| {
            // one hop only, the companion's own companion is never consulted
            technology
                .config_companion()
                .and_then(|companion| self.find_config(companion, working_dir))
        });

        let Some(path) = found else {
            debug!(
                technology = %technology,
                "No resolution config found, resolving from the default registry"
            );
            return Ok(default);
        };

        let content = std::fs::read_to_string(&path).map_err(|source| ResolverError::Read {
            path: path.clone(),
            source,
        })?;
        let config: ProjectConfig = serde_yaml::from_str(&content).map_err(|source| ResolverError::Parse {
            path: path.clone(),
            source,
        })?;
        let section = match config.resolver {
            Some(section) if !section.repo.trim().is_empty() => section,
            _ => return Err(ResolverError::MissingRepository { path }),
        };

        let server = match &section.server_id {
            Some(id) => Some(params.servers.get(id).cloned().ok_or_else(|| ResolverError::UnknownServer {
                server_id: id.clone(),
                path: path.clone(),
            })?),
            None => params.server.clone(),
        };

        debug!(
            technology = %technology,
            repo = %section.repo,
            config = %path.display(),
            "Using resolution repository"
        );
        Ok(Resolution {
            server,
            repository: Some(section.repo),
            source: Some(path),
        })
    }

    fn find_config(&self, technology: Technology, working_dir: &Path) -> Option<PathBuf> {
        let file_name = format!("{}.yaml", technology.as_str());
        for dir in working_dir.ancestors() {
            let candidate = dir.join(CONFIG_DIR).join(PROJECTS_DIR).join(&file_name);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        self.global_dir
            .as_ref()
            .map(|global| global.join(PROJECTS_DIR).join(&file_name))
            .filter(|candidate| candidate.is_file())
    }
}
