use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::error::TreeBuildError;
use crate::graph::{expand_tree, Edges, GraphNode};
use crate::models::Technology;

use super::{dir_name, read_descriptor, BuildContext, DependencyTrees, TreeBuilder};

/// Installed by `venv` itself; never reported as a top-level dependency.
const BOOTSTRAP_PACKAGES: &[&str] = &["pip", "setuptools", "wheel"];

const PYPI_INDEX_PATH: &str = "api/pypi/{repo}/simple";

/// One installed (or locked) Python distribution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct PythonPackage {
    pub name: String,
    pub version: String,
    /// Normalized names of required distributions.
    pub requires: Vec<String>,
}

/// PEP 503 normalization: lowercase, runs of `-`, `_` and `.` become `-`.
pub(crate) fn normalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut in_separator = false;
    for c in name.trim().chars() {
        if matches!(c, '-' | '_' | '.') {
            if !in_separator {
                out.push('-');
            }
            in_separator = true;
        } else {
            out.push(c.to_ascii_lowercase());
            in_separator = false;
        }
    }
    out
}

/// Leading distribution name of a requirement string like `ptyprocess (>=0.5)`.
fn requirement_name(spec: &str) -> Option<String> {
    let name: String = spec
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        .collect();
    if name.is_empty() {
        None
    } else {
        Some(normalize_name(&name))
    }
}

/// Build the single tree of a Python project.
///
/// `root_id` is a synthetic project node; its children are the top-level
/// packages, i.e. those no other package requires.
pub(crate) fn build_python_tree(
    technology: Technology,
    root_id: &str,
    packages: &BTreeMap<String, PythonPackage>,
) -> GraphNode {
    let id_of = |key: &str| -> Option<String> { packages.get(key).map(|p| technology.node_id(&p.name, &p.version)) };

    let required: HashSet<&str> = packages
        .values()
        .flat_map(|p| p.requires.iter().map(String::as_str))
        .collect();
    let mut top_level: Vec<String> = packages
        .keys()
        .filter(|k| !required.contains(k.as_str()) && !BOOTSTRAP_PACKAGES.contains(&k.as_str()))
        .cloned()
        .collect();

    // packages that only require each other have no top-level entry point
    let reachable = reachable_from(&top_level, packages);
    for key in packages.keys() {
        if !reachable.contains(key) && !BOOTSTRAP_PACKAGES.contains(&key.as_str()) {
            top_level.push(key.clone());
        }
    }

    let mut edges = Edges::new();
    edges.insert(root_id.to_string(), top_level.iter().filter_map(|k| id_of(k)).collect());
    for (key, package) in packages {
        let Some(id) = id_of(key) else { continue };
        let mut children = Vec::new();
        for requirement in &package.requires {
            match id_of(requirement) {
                Some(child) => children.push(child),
                None => debug!(package = %key, requirement = %requirement, "Requirement is not installed, omitting it"),
            }
        }
        edges.insert(id, children);
    }
    expand_tree(root_id, &edges, &BTreeMap::new())
}

fn reachable_from(start: &[String], packages: &BTreeMap<String, PythonPackage>) -> BTreeSet<String> {
    let mut seen: BTreeSet<String> = BTreeSet::new();
    let mut queue: VecDeque<&str> = start.iter().map(String::as_str).collect();
    while let Some(key) = queue.pop_front() {
        if !seen.insert(key.to_string()) {
            continue;
        }
        if let Some(package) = packages.get(key) {
            queue.extend(package.requires.iter().map(String::as_str));
        }
    }
    seen
}

fn project_root_id(ctx: &BuildContext) -> String {
    ctx.technology.node_id(&dir_name(&ctx.working_dir), "")
}

// ---------------------------------------------------------------------------
// pip
// ---------------------------------------------------------------------------

/// Installs the project into a throw-away virtualenv and reads the
/// installed distributions back.
pub struct PipBuilder;

#[derive(Debug, Clone, PartialEq, Eq)]
enum InstallTarget {
    /// `pip install .`
    Project,
    /// `pip install -r <file>`
    Requirements(String),
}

impl InstallTarget {
    fn args(&self) -> Vec<String> {
        match self {
            InstallTarget::Project => vec![".".to_string()],
            InstallTarget::Requirements(file) => vec!["-r".to_string(), file.clone()],
        }
    }
}

fn install_target(ctx: &BuildContext) -> Result<InstallTarget, TreeBuildError> {
    if let Some(file) = &ctx.requirements_file {
        return Ok(InstallTarget::Requirements(file.clone()));
    }
    if ctx.path("setup.py").is_file() || ctx.path("pyproject.toml").is_file() {
        return Ok(InstallTarget::Project);
    }
    if ctx.path("requirements.txt").is_file() {
        return Ok(InstallTarget::Requirements("requirements.txt".to_string()));
    }
    Err(TreeBuildError::MissingDescriptor(
        "setup.py, pyproject.toml or requirements.txt".to_string(),
    ))
}

/// `-m pip install (.|-r <file>) [-i <index>] [--cache-dir <dir>] [--ignore-installed --report <file>]`
fn pip_install_args(
    target: &InstallTarget,
    index_url: Option<&str>,
    cache_dir: Option<&Path>,
    report: Option<&Path>,
) -> Vec<String> {
    let mut args: Vec<String> = vec!["-m".into(), "pip".into(), "install".into()];
    args.extend(target.args());
    if let Some(index) = index_url {
        args.push("-i".into());
        args.push(index.to_string());
    }
    if let Some(dir) = cache_dir {
        args.push("--cache-dir".into());
        args.push(dir.to_string_lossy().into_owned());
    }
    if let Some(report) = report {
        args.push("--ignore-installed".into());
        args.push("--report".into());
        args.push(report.to_string_lossy().into_owned());
    }
    args
}

fn venv_python(venv: &Path) -> PathBuf {
    if cfg!(windows) {
        venv.join("Scripts").join("python.exe")
    } else {
        venv.join("bin").join("python")
    }
}

fn find_site_packages(venv: &Path) -> Result<PathBuf, TreeBuildError> {
    let windows_layout = venv.join("Lib").join("site-packages");
    if windows_layout.is_dir() {
        return Ok(windows_layout);
    }
    let lib = venv.join("lib");
    let entries = std::fs::read_dir(&lib).map_err(|e| TreeBuildError::io(&lib, e))?;
    for entry in entries.flatten() {
        let candidate = entry.path().join("site-packages");
        if entry.file_name().to_string_lossy().starts_with("python") && candidate.is_dir() {
            return Ok(candidate);
        }
    }
    Err(TreeBuildError::malformed("pip", format!("no site-packages under {}", venv.display())))
}

/// Parse the header block of a `METADATA` file.
///
/// `Requires-Dist` entries guarded by an `extra ==` marker are optional and
/// skipped.
pub(crate) fn parse_metadata(content: &str) -> Option<PythonPackage> {
    let mut name = None;
    let mut version = None;
    let mut requires = Vec::new();
    for line in content.lines() {
        if line.trim().is_empty() {
            break;
        }
        if let Some(value) = line.strip_prefix("Name:") {
            name = Some(normalize_name(value));
        } else if let Some(value) = line.strip_prefix("Version:") {
            version = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("Requires-Dist:") {
            let (spec, marker) = value.split_once(';').unwrap_or((value, ""));
            if marker.replace(' ', "").contains("extra==") {
                continue;
            }
            if let Some(requirement) = requirement_name(spec) {
                requires.push(requirement);
            }
        }
    }
    Some(PythonPackage {
        name: name?,
        version: version?,
        requires,
    })
}

fn read_installed_packages(site_packages: &Path) -> Result<BTreeMap<String, PythonPackage>, TreeBuildError> {
    let entries = std::fs::read_dir(site_packages).map_err(|e| TreeBuildError::io(site_packages, e))?;
    let mut packages = BTreeMap::new();
    for entry in entries.flatten() {
        let file_name = entry.file_name().to_string_lossy().into_owned();
        let metadata_file = if file_name.ends_with(".dist-info") {
            entry.path().join("METADATA")
        } else if file_name.ends_with(".egg-info") {
            entry.path().join("PKG-INFO")
        } else {
            continue;
        };
        let Ok(content) = std::fs::read_to_string(&metadata_file) else {
            debug!(path = %metadata_file.display(), "Missing package metadata, skipping");
            continue;
        };
        if let Some(package) = parse_metadata(&content) {
            packages.insert(package.name.clone(), package);
        }
    }
    Ok(packages)
}

#[derive(Debug, Deserialize)]
struct PipReport {
    #[serde(default)]
    install: Vec<PipReportItem>,
}

#[derive(Debug, Deserialize)]
struct PipReportItem {
    metadata: PipReportMetadata,
    #[serde(default)]
    download_info: Option<PipDownloadInfo>,
}

#[derive(Debug, Deserialize)]
struct PipReportMetadata {
    name: String,
    version: String,
}

#[derive(Debug, Deserialize)]
struct PipDownloadInfo {
    url: String,
}

fn read_pip_report(path: &Path, technology: Technology) -> Result<BTreeMap<String, String>, TreeBuildError> {
    let content = read_descriptor(path)?;
    let report: PipReport = serde_json::from_str(&content).map_err(|source| TreeBuildError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(report
        .install
        .into_iter()
        .filter_map(|item| {
            let url = item.download_info?.url;
            let id = technology.node_id(&normalize_name(&item.metadata.name), &item.metadata.version);
            Some((id, url))
        })
        .collect())
}

impl PipBuilder {
    async fn install(
        ctx: &BuildContext,
        python: &Path,
        target: &InstallTarget,
        report: Option<&Path>,
    ) -> Result<(), TreeBuildError> {
        let index = ctx.repository_url(PYPI_INDEX_PATH);
        let cache_dir = ctx.curation.as_ref().map(|c| c.pip_cache_dir.as_path());
        let args = pip_install_args(target, index.as_deref(), cache_dir, report);
        ctx.run(ctx.command(python.to_string_lossy()).args(args)).await?;
        Ok(())
    }
}

#[async_trait]
impl TreeBuilder for PipBuilder {
    async fn build_trees(&self, ctx: &BuildContext) -> Result<DependencyTrees, TreeBuildError> {
        let target = install_target(ctx)?;
        let venv = tempfile::Builder::new()
            .prefix("depaudit-venv-")
            .tempdir()
            .map_err(|e| TreeBuildError::io(std::env::temp_dir(), e))?;

        let python3 = if cfg!(windows) { "python" } else { "python3" };
        ctx.run(
            ctx.command(python3)
                .args(["-m", "venv"])
                .arg(venv.path().to_string_lossy()),
        )
        .await?;

        let python = venv_python(venv.path());
        let report_path = venv.path().join("pip-report.json");
        let report = ctx.is_curation().then_some(report_path.as_path());

        if let Err(err) = Self::install(ctx, &python, &target, report).await {
            let fallback = ctx.path("requirements.txt");
            if target != InstallTarget::Project || !fallback.is_file() {
                return Err(err);
            }
            debug!(error = %err, "Installing the project failed, retrying with requirements.txt");
            let fallback_target = InstallTarget::Requirements("requirements.txt".to_string());
            Self::install(ctx, &python, &fallback_target, report).await?;
        }

        let site_packages = find_site_packages(venv.path())?;
        let packages = read_installed_packages(&site_packages)?;
        let tree = build_python_tree(ctx.technology, &project_root_id(ctx), &packages);
        let mut trees = DependencyTrees::from_trees(vec![tree]);

        if ctx.is_curation() {
            let urls = read_pip_report(&report_path, ctx.technology)?;
            trees = trees.with_download_urls(urls);
        }
        Ok(trees)
    }
}

// ---------------------------------------------------------------------------
// pipenv
// ---------------------------------------------------------------------------

/// `pipenv install --dev` followed by `pipenv graph --json`.
pub struct PipenvBuilder;

#[derive(Debug, Deserialize)]
struct PipenvGraphEntry {
    package: PipenvPackage,
    #[serde(default)]
    dependencies: Vec<PipenvPackage>,
}

#[derive(Debug, Deserialize)]
struct PipenvPackage {
    key: String,
    #[serde(default)]
    installed_version: String,
}

pub(crate) fn parse_pipenv_graph(output: &str) -> Result<BTreeMap<String, PythonPackage>, TreeBuildError> {
    // pipenv may print notices before the JSON document
    let start = output
        .find('[')
        .ok_or_else(|| TreeBuildError::malformed("pipenv", "graph output has no JSON list"))?;
    let entries: Vec<PipenvGraphEntry> = serde_json::from_str(&output[start..])
        .map_err(|e| TreeBuildError::malformed("pipenv", e.to_string()))?;

    let mut packages = BTreeMap::new();
    for entry in entries {
        let name = normalize_name(&entry.package.key);
        let requires = entry
            .dependencies
            .iter()
            .map(|d| normalize_name(&d.key))
            .collect();
        packages.insert(
            name.clone(),
            PythonPackage {
                name,
                version: entry.package.installed_version,
                requires,
            },
        );
    }
    Ok(packages)
}

#[async_trait]
impl TreeBuilder for PipenvBuilder {
    async fn build_trees(&self, ctx: &BuildContext) -> Result<DependencyTrees, TreeBuildError> {
        if ctx.is_curation() {
            return Err(TreeBuildError::CurationUnsupported(ctx.technology));
        }
        if !ctx.path("Pipfile").is_file() {
            return Err(TreeBuildError::MissingDescriptor("Pipfile".to_string()));
        }

        let mut install = ctx.command("pipenv").args(["install", "--dev"]);
        if let Some(index) = ctx.repository_url(PYPI_INDEX_PATH) {
            install = install.env("PIPENV_PYPI_MIRROR", index);
        }
        ctx.run(install).await?;

        let graph = ctx.run(ctx.command("pipenv").args(["graph", "--json"])).await?;
        let packages = parse_pipenv_graph(&graph.stdout)?;
        let tree = build_python_tree(ctx.technology, &project_root_id(ctx), &packages);
        Ok(DependencyTrees::from_trees(vec![tree]))
    }
}

// ---------------------------------------------------------------------------
// poetry
// ---------------------------------------------------------------------------

/// Reads `pyproject.toml` and `poetry.lock`, locking first when needed.
pub struct PoetryBuilder;

#[derive(Debug, Deserialize)]
struct PoetryLock {
    #[serde(default)]
    package: Vec<PoetryLockPackage>,
}

#[derive(Debug, Deserialize)]
struct PoetryLockPackage {
    name: String,
    version: String,
    #[serde(default)]
    dependencies: BTreeMap<String, toml::Value>,
}

/// Project name, version and declared dependency names from `[tool.poetry]`.
fn parse_poetry_project(content: &str, path: &Path) -> Result<(String, String, Vec<String>), TreeBuildError> {
    let value: toml::Value = toml::from_str(content).map_err(|source| TreeBuildError::Toml {
        path: path.to_path_buf(),
        source,
    })?;
    let poetry = value
        .get("tool")
        .and_then(|t| t.get("poetry"))
        .ok_or_else(|| TreeBuildError::malformed("poetry", "pyproject.toml has no [tool.poetry] table"))?;

    let name = poetry.get("name").and_then(|v| v.as_str()).unwrap_or_default();
    let version = poetry.get("version").and_then(|v| v.as_str()).unwrap_or_default();

    let mut declared: Vec<String> = Vec::new();
    let mut add_table = |table: Option<&toml::Value>| {
        if let Some(table) = table.and_then(|t| t.as_table()) {
            for key in table.keys() {
                let key = normalize_name(key);
                if !declared.contains(&key) {
                    declared.push(key);
                }
            }
        }
    };
    add_table(poetry.get("dependencies"));
    add_table(poetry.get("dev-dependencies"));
    if let Some(groups) = poetry.get("group").and_then(|g| g.as_table()) {
        for group in groups.values() {
            add_table(group.get("dependencies"));
        }
    }
    Ok((normalize_name(name), version.to_string(), declared))
}

pub(crate) fn build_poetry_tree(
    pyproject: &str,
    pyproject_path: &Path,
    lock: &str,
    lock_path: &Path,
) -> Result<GraphNode, TreeBuildError> {
    let technology = Technology::Poetry;
    let (name, version, declared) = parse_poetry_project(pyproject, pyproject_path)?;
    let lock: PoetryLock = toml::from_str(lock).map_err(|source| TreeBuildError::Toml {
        path: lock_path.to_path_buf(),
        source,
    })?;

    let locked: BTreeMap<String, &PoetryLockPackage> =
        lock.package.iter().map(|p| (normalize_name(&p.name), p)).collect();
    let id_of = |key: &str| -> Option<String> {
        if key == "python" {
            return Some(technology.node_id("python", ""));
        }
        locked.get(key).map(|p| technology.node_id(&normalize_name(&p.name), &p.version))
    };

    let root_id = technology.node_id(&name, &version);
    let mut edges = Edges::new();
    let mut direct = Vec::new();
    for dependency in &declared {
        match id_of(dependency) {
            Some(id) => direct.push(id),
            None => debug!(dependency = %dependency, "Declared dependency is not locked, omitting it"),
        }
    }
    edges.insert(root_id.clone(), direct);
    for (key, package) in &locked {
        let Some(id) = id_of(key) else { continue };
        let children = package
            .dependencies
            .keys()
            .filter_map(|d| id_of(&normalize_name(d)))
            .collect();
        edges.insert(id, children);
    }
    Ok(expand_tree(&root_id, &edges, &BTreeMap::new()))
}

#[async_trait]
impl TreeBuilder for PoetryBuilder {
    async fn build_trees(&self, ctx: &BuildContext) -> Result<DependencyTrees, TreeBuildError> {
        if ctx.is_curation() {
            return Err(TreeBuildError::CurationUnsupported(ctx.technology));
        }
        let pyproject_path = ctx.path("pyproject.toml");
        if !pyproject_path.is_file() {
            return Err(TreeBuildError::MissingDescriptor("pyproject.toml".to_string()));
        }
        let lock_path = ctx.path("poetry.lock");
        if !lock_path.is_file() {
            debug!("poetry.lock not found, locking the project");
            ctx.run(ctx.command("poetry").arg("lock")).await?;
        }
        let pyproject = read_descriptor(&pyproject_path)?;
        let lock = read_descriptor(&lock_path)?;
        let tree = build_poetry_tree(&pyproject, &pyproject_path, &lock, &lock_path)?;
        Ok(DependencyTrees::from_trees(vec![tree]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::testing::{failed, ok, ScriptedRunner};
    use crate::command::CommandInvocation;
    use crate::config::ServerDetails;
    use crate::graph::UniqueDependencies;
    use crate::resolver::Resolution;
    use crate::technologies::CurationPaths;
    use std::sync::Arc;
    use tempfile::TempDir;

    const SITE: &str = "lib/python3.11/site-packages";

    fn write_dist(site: &Path, name: &str, version: &str, requires: &[&str]) {
        let dir = site.join(format!("{}-{}.dist-info", name.replace('-', "_"), version));
        std::fs::create_dir_all(&dir).unwrap();
        let mut meta = format!("Metadata-Version: 2.1\nName: {name}\nVersion: {version}\n");
        for requirement in requires {
            meta.push_str(&format!("Requires-Dist: {requirement}\n"));
        }
        meta.push_str("\nName: not-a-header\n");
        std::fs::write(dir.join("METADATA"), meta).unwrap();
    }

    fn is_venv(inv: &CommandInvocation) -> bool {
        inv.args.get(1).map(String::as_str) == Some("venv")
    }

    fn is_pip_install(inv: &CommandInvocation) -> bool {
        inv.args.iter().take(3).map(String::as_str).eq(["-m", "pip", "install"])
    }

    /// venv creation lays out site-packages with the bootstrap packages.
    fn create_venv(inv: &CommandInvocation) -> Result<crate::command::CommandOutput, crate::error::CommandError> {
        let site = PathBuf::from(&inv.args[2]).join(SITE);
        write_dist(&site, "pip", "23.2", &[]);
        write_dist(&site, "setuptools", "68.0.0", &[]);
        ok("")
    }

    fn site_of(inv: &CommandInvocation) -> PathBuf {
        Path::new(&inv.program).parent().unwrap().parent().unwrap().join(SITE)
    }

    fn install_pexpect(site: &Path) {
        write_dist(site, "pexpect", "4.8.0", &["ptyprocess (>=0.5)"]);
        write_dist(site, "ptyprocess", "0.7.0", &[]);
    }

    fn project(files: &[&str]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for file in files {
            std::fs::write(dir.path().join(file), "").unwrap();
        }
        dir
    }

    fn ids(unique: &UniqueDependencies) -> Vec<&str> {
        unique.ids()
    }

    #[tokio::test]
    async fn test_pip_installs_setup_py_project() {
        let dir = project(&["setup.py"]);
        let runner = Arc::new(ScriptedRunner::new().on(is_venv, create_venv).on(is_pip_install, |inv| {
            let site = site_of(inv);
            write_dist(&site, "pip-example", "1.2.3", &["pexpect (==4.8.0)"]);
            install_pexpect(&site);
            ok("")
        }));
        let ctx = BuildContext::new(Technology::Pip, dir.path(), runner.clone());

        let deps = PipBuilder.build_trees(&ctx).await.unwrap();
        assert_eq!(deps.trees.len(), 1);
        let root = &deps.trees[0];
        let example = root.child("pypi://pip-example:1.2.3").unwrap();
        let pexpect = example.child("pypi://pexpect:4.8.0").unwrap();
        assert!(pexpect.child("pypi://ptyprocess:0.7.0").is_some());
        assert_eq!(
            ids(&deps.unique),
            vec!["pypi://pexpect:4.8.0", "pypi://pip-example:1.2.3", "pypi://ptyprocess:0.7.0"]
        );

        let install = runner.recorded().into_iter().find(is_pip_install).unwrap();
        assert_eq!(install.args, vec!["-m", "pip", "install", "."]);
        assert_eq!(install.current_dir, dir.path());
    }

    #[tokio::test]
    async fn test_pip_falls_back_to_requirements_and_matches_pipenv() {
        let dir = project(&["setup.py", "requirements.txt"]);
        let runner = Arc::new(
            ScriptedRunner::new()
                .on(is_venv, create_venv)
                .on(|inv| is_pip_install(inv) && inv.args.contains(&".".to_string()), |inv| {
                    failed(inv, "error: invalid command 'egg_info'")
                })
                .on(is_pip_install, |inv| {
                    install_pexpect(&site_of(inv));
                    ok("")
                }),
        );
        let ctx = BuildContext::new(Technology::Pip, dir.path(), runner.clone());
        let pip = PipBuilder.build_trees(&ctx).await.unwrap();

        let installs: Vec<_> = runner.recorded().into_iter().filter(is_pip_install).collect();
        assert_eq!(installs.len(), 2);
        assert_eq!(installs[1].args, vec!["-m", "pip", "install", "-r", "requirements.txt"]);

        let pipenv_dir = project(&["Pipfile"]);
        let graph = r#"Loading .env environment variables...
[
  {"package": {"key": "pexpect", "package_name": "pexpect", "installed_version": "4.8.0"},
   "dependencies": [{"key": "ptyprocess", "package_name": "ptyprocess", "installed_version": "0.7.0", "required_version": ">=0.5"}]},
  {"package": {"key": "ptyprocess", "package_name": "ptyprocess", "installed_version": "0.7.0"}, "dependencies": []}
]"#;
        let pipenv_runner = Arc::new(
            ScriptedRunner::new()
                .on(|inv| inv.args.first().map(String::as_str) == Some("install"), |_| ok(""))
                .on(|inv| inv.args.first().map(String::as_str) == Some("graph"), move |_| ok(graph)),
        );
        let ctx = BuildContext::new(Technology::Pipenv, pipenv_dir.path(), pipenv_runner);
        let pipenv = PipenvBuilder.build_trees(&ctx).await.unwrap();

        assert_eq!(pip.unique, pipenv.unique);
        assert_eq!(ids(&pip.unique), vec!["pypi://pexpect:4.8.0", "pypi://ptyprocess:0.7.0"]);
        let pexpect = pipenv.trees[0].child("pypi://pexpect:4.8.0").unwrap();
        assert!(pexpect.child("pypi://ptyprocess:0.7.0").is_some());
    }

    #[tokio::test]
    async fn test_pip_curation_records_download_urls() {
        let dir = project(&["requirements.txt"]);
        let curation = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new().on(is_venv, create_venv).on(is_pip_install, |inv| {
            install_pexpect(&site_of(inv));
            let at = inv.args.iter().position(|a| a == "--report").unwrap();
            let base = "https://acme.example.com/artifactory/api/pypi/pypi-remote/packages/packages";
            let report = format!(
                r#"{{"version": "1", "install": [
  {{"metadata": {{"name": "pexpect", "version": "4.8.0"}},
    "download_info": {{"url": "{base}/39/7b/88dbb785881c28a10/pexpect-4.8.0-py2.py3-none-any.whl"}}}},
  {{"metadata": {{"name": "ptyprocess", "version": "0.7.0"}},
    "download_info": {{"url": "{base}/22/a6/858897256d0deac81/ptyprocess-0.7.0-py2.py3-none-any.whl"}}}}
]}}"#
            );
            std::fs::write(&inv.args[at + 1], report).unwrap();
            ok("")
        }));

        let mut ctx = BuildContext::new(Technology::Pip, dir.path(), runner.clone());
        ctx.resolution = Resolution {
            server: Some(ServerDetails {
                url: "https://acme.example.com".into(),
                access_token: Some("tkn".into()),
                ..Default::default()
            }),
            repository: Some("pypi-remote".into()),
            source: None,
        };
        ctx.curation = Some(CurationPaths {
            cache_dir: curation.path().join("cache/pip/hash"),
            pip_cache_dir: curation.path().join("cache/pip"),
        });

        let deps = PipBuilder.build_trees(&ctx).await.unwrap();
        assert_eq!(deps.download_urls.len(), 2);
        assert!(deps.download_urls["pypi://ptyprocess:0.7.0"].contains("/packages/packages/22/a6/"));
        assert!(deps.download_urls["pypi://pexpect:4.8.0"].contains("/packages/packages/39/7b/"));

        let install = runner.recorded().into_iter().find(is_pip_install).unwrap();
        assert_eq!(&install.args[3..5], &["-r", "requirements.txt"]);
        assert_eq!(install.args[5], "-i");
        assert!(install.args[6].ends_with("/artifactory/api/pypi/pypi-remote/simple"));
        assert!(install.args.contains(&"--cache-dir".to_string()));
        assert!(install.args.contains(&"--ignore-installed".to_string()));
    }

    #[test]
    fn test_pip_install_args() {
        assert_eq!(pip_install_args(&InstallTarget::Project, None, None, None), vec!["-m", "pip", "install", "."]);
        assert_eq!(
            pip_install_args(
                &InstallTarget::Requirements("requirements.txt".into()),
                Some("https://u:p@remote/simple"),
                None,
                None
            ),
            vec!["-m", "pip", "install", "-r", "requirements.txt", "-i", "https://u:p@remote/simple"]
        );
    }

    #[test]
    fn test_parse_metadata_skips_extras() {
        let meta = "Metadata-Version: 2.1\nName: Requests_Toolbelt\nVersion: 1.0.0\n\
Requires-Dist: requests (<3.0.0,>=2.0.1)\n\
Requires-Dist: pytest ; extra == 'test'\n\
Requires-Dist: colorama; sys_platform == \"win32\"\n\nbody";
        let package = parse_metadata(meta).unwrap();
        assert_eq!(package.name, "requests-toolbelt");
        assert_eq!(package.version, "1.0.0");
        assert_eq!(package.requires, vec!["requests", "colorama"]);
    }

    #[test]
    fn test_missing_requirement_is_omitted() {
        let mut packages = BTreeMap::new();
        packages.insert(
            "app".to_string(),
            PythonPackage {
                name: "app".into(),
                version: "1.0".into(),
                requires: vec!["ghost".into()],
            },
        );
        let tree = build_python_tree(Technology::Pip, "pypi://proj:", &packages);
        let app = tree.child("pypi://app:1.0").unwrap();
        assert!(app.nodes.is_empty());
    }

    #[tokio::test]
    async fn test_pipenv_curation_is_unsupported() {
        let dir = project(&["Pipfile"]);
        let mut ctx = BuildContext::new(Technology::Pipenv, dir.path(), Arc::new(ScriptedRunner::new()));
        ctx.curation = Some(CurationPaths {
            cache_dir: dir.path().join("c"),
            pip_cache_dir: dir.path().join("p"),
        });
        let err = PipenvBuilder.build_trees(&ctx).await.unwrap_err();
        assert!(matches!(err, TreeBuildError::CurationUnsupported(Technology::Pipenv)));
    }

    #[tokio::test]
    async fn test_poetry_tree_from_lock() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("pyproject.toml"),
            r#"[tool.poetry]
name = "my-poetry-project"
version = "0.1.0"

[tool.poetry.dependencies]
python = "^3.8"
numpy = "^1.26"

[tool.poetry.group.dev.dependencies]
pytest = "^5.4"
"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("poetry.lock"),
            r#"[[package]]
name = "numpy"
version = "1.26.1"

[[package]]
name = "pytest"
version = "5.4.3"

[package.dependencies]
packaging = "*"
pluggy = ">=0.12,<1.0"

[[package]]
name = "packaging"
version = "23.2"

[[package]]
name = "pluggy"
version = "0.13.1"
"#,
        )
        .unwrap();

        let ctx = BuildContext::new(Technology::Poetry, dir.path(), Arc::new(ScriptedRunner::new()));
        let deps = PoetryBuilder.build_trees(&ctx).await.unwrap();
        let root = &deps.trees[0];
        assert_eq!(root.id, "pypi://my-poetry-project:0.1.0");
        assert!(root.child("pypi://python:").is_some());
        let pytest = root.child("pypi://pytest:5.4.3").unwrap();
        assert!(pytest.child("pypi://packaging:23.2").is_some());
        assert_eq!(
            ids(&deps.unique),
            vec![
                "pypi://numpy:1.26.1",
                "pypi://packaging:23.2",
                "pypi://pluggy:0.13.1",
                "pypi://pytest:5.4.3",
                "pypi://python:",
            ]
        );
    }
}
