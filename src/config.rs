use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::models::{Severity, Technology};

/// Connection details of a platform hosting the package registries and the
/// scanning service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ServerDetails {
    /// Filled from the `[servers.<id>]` table key.
    #[serde(skip)]
    pub server_id: String,
    pub url: String,
    #[serde(default)]
    pub artifactory_url: Option<String>,
    #[serde(default)]
    pub xray_url: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
}

impl ServerDetails {
    pub fn artifactory_url(&self) -> String {
        match &self.artifactory_url {
            Some(url) => with_trailing_slash(url),
            None => format!("{}artifactory/", with_trailing_slash(&self.url)),
        }
    }

    pub fn xray_url(&self) -> String {
        match &self.xray_url {
            Some(url) => with_trailing_slash(url),
            None => format!("{}xray/", with_trailing_slash(&self.url)),
        }
    }

    /// Credentials to embed in registry URLs: `(user, secret)`.
    pub fn credentials(&self) -> Option<(String, String)> {
        if let Some(token) = &self.access_token {
            let user = self.user.clone().unwrap_or_default();
            return Some((user, token.clone()));
        }
        match (&self.user, &self.password) {
            (Some(user), Some(password)) => Some((user.clone(), password.clone())),
            _ => None,
        }
    }
}

fn with_trailing_slash(url: &str) -> String {
    if url.ends_with('/') {
        url.to_string()
    } else {
        format!("{}/", url)
    }
}

/// Which npm dependency kinds to include.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NpmScope {
    #[default]
    All,
    DevOnly,
    ProdOnly,
}

/// Parameters of one audit run. Built once by the caller and shared
/// read-only with every worker.
#[derive(Debug, Clone)]
pub struct AuditParams {
    /// Default server for scanning and resolution.
    pub server: Option<ServerDetails>,
    /// Every configured server, for `serverId` lookups in resolution configs.
    pub servers: BTreeMap<String, ServerDetails>,
    pub working_dirs: Vec<PathBuf>,
    pub recursive: bool,
    /// Empty means every detectable technology.
    pub technologies: Vec<Technology>,
    /// Wildcard patterns; empty selects the default exclusions.
    pub exclusions: Vec<String>,
    pub requirements_file: Option<String>,
    pub npm_scope: NpmScope,
    /// Resolution repository override for every technology.
    pub deps_repo: Option<String>,
    pub ignore_config_file: bool,
    pub use_wrapper: bool,
    pub min_severity: Option<Severity>,
    pub fixable_only: bool,
    pub curation: bool,
    pub third_party_applicability: bool,
    pub include_licenses: bool,
    pub project_key: Option<String>,
    pub watches: Vec<String>,
    pub threads: usize,
    /// Bound on each blocking step of a pair (tree build, remote scan).
    pub timeout: Option<Duration>,
}

pub const DEFAULT_THREADS: usize = 3;

impl Default for AuditParams {
    fn default() -> Self {
        Self {
            server: None,
            servers: BTreeMap::new(),
            working_dirs: Vec::new(),
            recursive: false,
            technologies: Vec::new(),
            exclusions: Vec::new(),
            requirements_file: None,
            npm_scope: NpmScope::All,
            deps_repo: None,
            ignore_config_file: false,
            use_wrapper: false,
            min_severity: None,
            fixable_only: false,
            curation: false,
            third_party_applicability: false,
            include_licenses: false,
            project_key: None,
            watches: Vec::new(),
            threads: DEFAULT_THREADS,
            timeout: None,
        }
    }
}

/// Tool configuration, deserialized from `.depaudit/config.toml`.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    /// Server used when `--server-id` is not given.
    #[serde(default)]
    pub default_server: Option<String>,
    #[serde(default)]
    pub servers: BTreeMap<String, ServerDetails>,
    #[serde(default)]
    pub audit: AuditDefaults,
}

/// `[audit]` table: defaults for flags not given on the command line.
#[derive(Debug, Default, Deserialize)]
pub struct AuditDefaults {
    #[serde(default)]
    pub threads: Option<usize>,
    #[serde(default)]
    pub exclusions: Vec<String>,
    #[serde(default)]
    pub min_severity: Option<String>,
    #[serde(default)]
    pub fixable_only: Option<bool>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Config {
    /// Server by id, or the default server when `id` is `None`.
    pub fn server(&self, id: Option<&str>) -> Option<ServerDetails> {
        let id = id.or(self.default_server.as_deref())?;
        self.servers.get(id).cloned()
    }

    fn parse(content: &str, path: &Path) -> Result<Config> {
        let mut config: Config =
            toml::from_str(content).with_context(|| format!("invalid config file {}", path.display()))?;
        for (id, server) in config.servers.iter_mut() {
            server.server_id = id.clone();
        }
        Ok(config)
    }
}

/// Load the tool configuration, searching in order:
///
/// 1. `config_override`, the path passed via `--config`
/// 2. `<project_path>/.depaudit/config.toml`
/// 3. `~/.config/depaudit/config.toml`
/// 4. Built-in [`Config::default`]
pub fn load_config(project_path: &Path, config_override: Option<&Path>) -> Result<Config> {
    if let Some(path) = config_override {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        return Config::parse(&content, path);
    }

    let project_config = project_path.join(".depaudit").join("config.toml");
    if project_config.exists() {
        let content = std::fs::read_to_string(&project_config)?;
        return Config::parse(&content, &project_config);
    }

    if let Some(home) = dirs::home_dir() {
        let home_config = home.join(".config").join("depaudit").join("config.toml");
        if home_config.exists() {
            let content = std::fs::read_to_string(&home_config)?;
            return Config::parse(&content, &home_config);
        }
    }

    Ok(Config::default())
}
