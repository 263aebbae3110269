use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use ignore::WalkBuilder;
use regex::Regex;
use tracing::{debug, warn};

use crate::config::AuditParams;
use crate::error::DetectionError;
use crate::models::Technology;

/// Applied when no exclusion is configured: VCS metadata, installed
/// packages, build output, virtual environments and test fixtures.
pub const DEFAULT_EXCLUDE_PATTERNS: &[&str] = &["*.git*", "*node_modules*", "*target*", "*venv*", "*test*"];

/// Technology → working directory → descriptor files.
pub type TechnologyDirs = BTreeMap<Technology, BTreeMap<PathBuf, Vec<PathBuf>>>;

#[derive(Debug, Clone, Default)]
pub struct DetectorOptions {
    pub recursive: bool,
    /// Empty detects every technology.
    pub technologies: Vec<Technology>,
    /// Extra descriptor file names per technology. A file with one of these
    /// names marks its directory as a working directory.
    pub requested_descriptors: BTreeMap<Technology, Vec<String>>,
    /// Wildcard patterns (`*` and `?`) matched against paths relative to
    /// the root.
    pub exclusions: Vec<String>,
}

impl DetectorOptions {
    pub fn from_params(params: &AuditParams) -> Self {
        let mut requested_descriptors = BTreeMap::new();
        if let Some(file) = &params.requirements_file {
            requested_descriptors.insert(Technology::Pip, vec![file_name_of(file)]);
        }
        let exclusions = if params.exclusions.is_empty() {
            DEFAULT_EXCLUDE_PATTERNS.iter().map(|p| p.to_string()).collect()
        } else {
            params.exclusions.clone()
        };
        Self {
            recursive: params.recursive,
            technologies: params.technologies.clone(),
            requested_descriptors,
            exclusions,
        }
    }
}

fn file_name_of(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

/// Detect the technologies used under `root` and the working directories
/// of each.
///
/// Requested technologies without any working directory are still present
/// in the result, with an empty map.
pub fn detect_technologies(root: &Path, options: &DetectorOptions) -> Result<TechnologyDirs, DetectionError> {
    if !root.is_dir() {
        return Err(DetectionError::NotADirectory(root.to_path_buf()));
    }
    let files_by_dir = list_files(root, options)?;

    let candidates: Vec<Technology> = if options.technologies.is_empty() {
        Technology::ALL.to_vec()
    } else {
        options.technologies.clone()
    };

    let mut detected = TechnologyDirs::new();
    for tech in candidates {
        let requested = options
            .requested_descriptors
            .get(&tech)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        let mut dirs: BTreeMap<PathBuf, Vec<PathBuf>> = BTreeMap::new();
        for (dir, names) in &files_by_dir {
            if !is_working_dir(tech, dir, names, requested) {
                continue;
            }
            let descriptors = names
                .iter()
                .filter(|n| matches_any(n, tech.descriptors()) || requested.contains(n))
                .map(|n| dir.join(n))
                .collect();
            dirs.insert(dir.clone(), descriptors);
        }
        if tech.merges_nested_modules() {
            dirs = merge_nested_modules(dirs);
        }
        if !dirs.is_empty() {
            debug!(technology = %tech, dirs = dirs.len(), "Detected working directories");
        }
        if !dirs.is_empty() || !options.technologies.is_empty() {
            detected.insert(tech, dirs);
        }
    }
    Ok(detected)
}

fn is_working_dir(tech: Technology, dir: &Path, names: &[String], requested: &[String]) -> bool {
    if names.iter().any(|n| matches_any(n, tech.excluded_by())) {
        return false;
    }
    names.iter().any(|name| {
        if requested.contains(name) {
            return true;
        }
        if !matches_any(name, tech.indicators()) {
            return false;
        }
        // a bare pyproject.toml is also how setuptools and hatch projects look
        if tech == Technology::Poetry && name == "pyproject.toml" {
            return names.iter().any(|n| n == "poetry.lock") || declares_poetry(&dir.join(name));
        }
        true
    })
}

fn declares_poetry(pyproject: &Path) -> bool {
    std::fs::read_to_string(pyproject)
        .map(|content| content.contains("[tool.poetry"))
        .unwrap_or(false)
}

/// Exact file name, or suffix match for patterns starting with a dot.
fn matches_any(name: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|p| {
        if p.starts_with('.') && !name.starts_with('.') {
            name.ends_with(p)
        } else {
            name == *p
        }
    })
}

/// Fold descriptors of nested module directories into the closest ancestor
/// that is itself a working directory.
fn merge_nested_modules(dirs: BTreeMap<PathBuf, Vec<PathBuf>>) -> BTreeMap<PathBuf, Vec<PathBuf>> {
    let mut merged: BTreeMap<PathBuf, Vec<PathBuf>> = BTreeMap::new();
    // BTreeMap order visits every ancestor before its descendants
    for (dir, descriptors) in dirs {
        let ancestor = merged.keys().rev().find(|parent| dir.starts_with(parent)).cloned();
        match ancestor {
            Some(parent) => merged.entry(parent).or_default().extend(descriptors),
            None => {
                merged.insert(dir, descriptors);
            }
        }
    }
    merged
}

fn wildcard_to_regex(pattern: &str) -> Result<Regex, DetectionError> {
    let mut expr = String::from("^");
    for c in pattern.chars() {
        match c {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            other => expr.push_str(&regex::escape(&other.to_string())),
        }
    }
    expr.push('$');
    Regex::new(&expr).map_err(|source| DetectionError::Exclusion {
        pattern: pattern.to_string(),
        source,
    })
}

fn list_files(root: &Path, options: &DetectorOptions) -> Result<BTreeMap<PathBuf, Vec<String>>, DetectionError> {
    let exclusions = options
        .exclusions
        .iter()
        .map(|p| wildcard_to_regex(p))
        .collect::<Result<Vec<_>, _>>()?;

    let filter_root = root.to_path_buf();
    let mut builder = WalkBuilder::new(root);
    builder
        .standard_filters(false)
        .follow_links(false)
        .max_depth(if options.recursive { None } else { Some(1) })
        .filter_entry(move |entry| {
            if entry.depth() == 0 {
                return true;
            }
            let relative = entry
                .path()
                .strip_prefix(&filter_root)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .replace('\\', "/");
            !exclusions.iter().any(|re| re.is_match(&relative))
        });

    let mut files_by_dir: BTreeMap<PathBuf, Vec<String>> = BTreeMap::new();
    for (index, result) in builder.build().enumerate() {
        let entry = match result {
            Ok(entry) => entry,
            Err(source) if index == 0 => {
                return Err(DetectionError::Walk {
                    path: root.to_path_buf(),
                    source,
                })
            }
            Err(e) => {
                warn!(error = %e, "Skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        let (Some(dir), Some(name)) = (entry.path().parent(), entry.path().file_name()) else {
            continue;
        };
        files_by_dir
            .entry(dir.to_path_buf())
            .or_default()
            .push(name.to_string_lossy().into_owned());
    }
    for names in files_by_dir.values_mut() {
        names.sort();
    }
    Ok(files_by_dir)
}
