use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A package ecosystem (or a specific tool of one) that `depaudit` can audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Technology {
    Maven,
    Gradle,
    Npm,
    Yarn,
    Go,
    Pip,
    Pipenv,
    Poetry,
    Nuget,
    Dotnet,
}

/// Which resolved dependencies are handed to applicability analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplicabilityPolicy {
    /// Only immediate children of each full tree's root.
    DirectOnly,
    /// Every resolved dependency (the flattened graph).
    AllDependencies,
    /// Every resolved dependency, but only when third-party analysis was requested.
    AllWhenRequested,
}

impl Technology {
    pub const ALL: [Technology; 10] = [
        Technology::Maven,
        Technology::Gradle,
        Technology::Npm,
        Technology::Yarn,
        Technology::Go,
        Technology::Pip,
        Technology::Pipenv,
        Technology::Poetry,
        Technology::Nuget,
        Technology::Dotnet,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Technology::Maven => "maven",
            Technology::Gradle => "gradle",
            Technology::Npm => "npm",
            Technology::Yarn => "yarn",
            Technology::Go => "go",
            Technology::Pip => "pip",
            Technology::Pipenv => "pipenv",
            Technology::Poetry => "poetry",
            Technology::Nuget => "nuget",
            Technology::Dotnet => "dotnet",
        }
    }

    /// Human readable name used in log lines.
    pub fn formal_name(&self) -> &'static str {
        match self {
            Technology::Maven => "Maven",
            Technology::Gradle => "Gradle",
            Technology::Npm => "npm",
            Technology::Yarn => "Yarn",
            Technology::Go => "Go",
            Technology::Pip => "pip",
            Technology::Pipenv => "Pipenv",
            Technology::Poetry => "Poetry",
            Technology::Nuget => "NuGet",
            Technology::Dotnet => ".NET",
        }
    }

    /// Prefix of every graph node identifier produced for this technology.
    pub fn id_prefix(&self) -> &'static str {
        match self {
            Technology::Maven | Technology::Gradle => "gav://",
            Technology::Npm | Technology::Yarn => "npm://",
            Technology::Go => "go://",
            Technology::Pip | Technology::Pipenv | Technology::Poetry => "pypi://",
            Technology::Nuget | Technology::Dotnet => "nuget://",
        }
    }

    /// Builds the canonical `<prefix><name>:<version>` node identifier.
    pub fn node_id(&self, name: &str, version: &str) -> String {
        format!("{}{}:{}", self.id_prefix(), name, version)
    }

    /// File names (or `.ext` suffixes) whose presence marks a working directory.
    pub fn indicators(&self) -> &'static [&'static str] {
        match self {
            Technology::Maven => &["pom.xml"],
            Technology::Gradle => &[".gradle", ".gradle.kts"],
            Technology::Npm => &["package.json", "package-lock.json", "npm-shrinkwrap.json"],
            Technology::Yarn => &[".yarnrc.yml", "yarn.lock"],
            Technology::Go => &["go.mod"],
            Technology::Pip => &["setup.py", "requirements.txt"],
            Technology::Pipenv => &["Pipfile", "Pipfile.lock"],
            Technology::Poetry => &["pyproject.toml", "poetry.lock"],
            Technology::Nuget | Technology::Dotnet => &[".sln", ".csproj", ".fsproj", ".vbproj"],
        }
    }

    /// File names (or `.ext` suffixes) reported as descriptors of a working directory.
    pub fn descriptors(&self) -> &'static [&'static str] {
        match self {
            Technology::Maven => &["pom.xml"],
            Technology::Gradle => &["build.gradle", "build.gradle.kts"],
            Technology::Npm | Technology::Yarn => &["package.json"],
            Technology::Go => &["go.mod"],
            Technology::Pip => &["setup.py", "requirements.txt"],
            Technology::Pipenv => &["Pipfile"],
            Technology::Poetry => &["pyproject.toml"],
            Technology::Nuget | Technology::Dotnet => &[".sln", ".csproj", ".fsproj", ".vbproj"],
        }
    }

    /// Indicators of another technology that rule this one out in the same directory.
    pub fn excluded_by(&self) -> &'static [&'static str] {
        match self {
            Technology::Npm => &[".yarnrc.yml", "yarn.lock"],
            _ => &[],
        }
    }

    /// The sibling technology that is always detected alongside this one and
    /// already covers it.
    pub fn subsumed_by(&self) -> Option<Technology> {
        match self {
            Technology::Dotnet => Some(Technology::Nuget),
            _ => None,
        }
    }

    /// Technology whose resolution config is consulted when this one has none.
    pub fn config_companion(&self) -> Option<Technology> {
        match self {
            Technology::Nuget => Some(Technology::Dotnet),
            _ => None,
        }
    }

    /// Whether descriptors in nested directories belong to the closest
    /// ancestor working directory (multi-module builds).
    pub fn merges_nested_modules(&self) -> bool {
        matches!(
            self,
            Technology::Maven | Technology::Gradle | Technology::Nuget | Technology::Dotnet
        )
    }

    // pipdeptree reports some direct dependencies as transitive, so pip always
    // sends everything. Only npm honours the third-party flag.
    pub fn applicability_policy(&self) -> ApplicabilityPolicy {
        match self {
            Technology::Pip => ApplicabilityPolicy::AllDependencies,
            Technology::Npm => ApplicabilityPolicy::AllWhenRequested,
            _ => ApplicabilityPolicy::DirectOnly,
        }
    }
}

impl std::fmt::Display for Technology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Technology {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Technology::ALL
            .iter()
            .copied()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown technology '{}'", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum Severity {
    #[default]
    Unknown,
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Unknown => write!(f, "Unknown"),
            Severity::Low => write!(f, "Low"),
            Severity::Medium => write!(f, "Medium"),
            Severity::High => write!(f, "High"),
            Severity::Critical => write!(f, "Critical"),
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            "unknown" => Ok(Severity::Unknown),
            other => Err(format!("unknown severity '{}'", other)),
        }
    }
}

/// One hop of an impact path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImpactPathNode {
    pub component_id: String,
}

/// A flagged component inside a scan response, keyed by flat node id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Component {
    #[serde(default)]
    pub fixed_versions: Vec<String>,
    #[serde(default)]
    pub impact_paths: Vec<Vec<ImpactPathNode>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cve {
    #[serde(default)]
    pub cve: Option<String>,
    #[serde(default)]
    pub cvss_v3_score: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Vulnerability {
    #[serde(default)]
    pub issue_id: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub cves: Vec<Cve>,
    #[serde(default)]
    pub components: BTreeMap<String, Component>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    #[serde(default)]
    pub issue_id: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default, rename = "type")]
    pub violation_type: String,
    #[serde(default)]
    pub watch_name: String,
    #[serde(default)]
    pub components: BTreeMap<String, Component>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct License {
    #[serde(default, rename = "license_key")]
    pub key: String,
    #[serde(default, rename = "license_name")]
    pub name: String,
    #[serde(default)]
    pub components: BTreeMap<String, Component>,
}

/// The remote scanner's answer for one flat graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanResponse {
    #[serde(default)]
    pub scan_id: String,
    #[serde(default)]
    pub vulnerabilities: Vec<Vulnerability>,
    #[serde(default)]
    pub violations: Vec<Violation>,
    #[serde(default)]
    pub licenses: Vec<License>,
}

impl ScanResponse {
    /// Every component map in the response, across all issue kinds.
    pub fn components_mut(&mut self) -> impl Iterator<Item = &mut BTreeMap<String, Component>> {
        self.vulnerabilities
            .iter_mut()
            .map(|v| &mut v.components)
            .chain(self.violations.iter_mut().map(|v| &mut v.components))
            .chain(self.licenses.iter_mut().map(|l| &mut l.components))
    }
}

/// One technology's scan outcome for one working directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaScanResult {
    pub working_directory: PathBuf,
    pub technology: Technology,
    #[serde(default)]
    pub descriptors: Vec<PathBuf>,
    #[serde(default)]
    pub is_multiple_root_project: Option<bool>,
    #[serde(default)]
    pub scan_responses: Vec<ScanResponse>,
    /// Dependency id → download URL; only filled in curation mode.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub download_urls: BTreeMap<String, String>,
}

impl ScaScanResult {
    pub fn new(working_directory: PathBuf, technology: Technology, descriptors: Vec<PathBuf>) -> Self {
        Self {
            working_directory,
            technology,
            descriptors,
            is_multiple_root_project: None,
            scan_responses: Vec::new(),
            download_urls: BTreeMap::new(),
        }
    }
}
