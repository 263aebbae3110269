//! Error types for every stage of an audit run.
//!
//! Pair-scoped failures never abort the run. They are wrapped in a
//! [`PairFailure`] and joined into [`ScanErrors`], which is empty on success.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::models::Technology;

/// Failure while running an external tool.
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("'{program} {args}' exited with {status}:\n{stderr}")]
    Failed {
        program: String,
        args: String,
        status: String,
        stderr: String,
    },
    #[error("'{program}' timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },
}

/// Failure of an ecosystem adapter while building dependency trees.
#[derive(Error, Debug)]
pub enum TreeBuildError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid TOML in {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid YAML in {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("no {0} descriptor was found in the working directory")]
    MissingDescriptor(String),
    #[error("unexpected {tool} output: {message}")]
    Malformed { tool: String, message: String },
    #[error("curation is not supported for {0}")]
    CurationUnsupported(Technology),
}

impl TreeBuildError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TreeBuildError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn malformed(tool: &str, message: impl Into<String>) -> Self {
        TreeBuildError::Malformed {
            tool: tool.to_string(),
            message: message.into(),
        }
    }
}

/// Failure while resolving the per-technology resolution repository.
#[derive(Error, Debug)]
pub enum ResolverError {
    #[error("failed while reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed while parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("{path} does not define a resolver repository")]
    MissingRepository { path: PathBuf },
    #[error("server '{server_id}' referenced by {path} is not configured")]
    UnknownServer { server_id: String, path: PathBuf },
}

/// Failure talking to the remote scanning service.
#[derive(Error, Debug)]
pub enum ScanServiceError {
    #[error("no scanning server is configured")]
    MissingServer,
    #[error("invalid scanning service URL '{0}'")]
    InvalidUrl(String),
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("scanning service answered {status}: {body}")]
    Status { status: u16, body: String },
    #[error("scan '{scan_id}' did not complete after {attempts} polls")]
    PollingExhausted { scan_id: String, attempts: u32 },
}

/// A root directory that could not be enumerated.
#[derive(Error, Debug)]
pub enum DetectionError {
    #[error("{0} is not a directory")]
    NotADirectory(PathBuf),
    #[error("invalid exclusion pattern '{pattern}': {source}")]
    Exclusion {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("failed to walk {path}: {source}")]
    Walk {
        path: PathBuf,
        #[source]
        source: ignore::Error,
    },
}

/// Errors scoped to one (technology, working directory) pair, plus the
/// setup failure that halts the whole run.
#[derive(Error, Debug)]
pub enum AuditError {
    #[error("no dependencies were found. Please try to build your project and re-run the audit command")]
    NoDependencies,
    #[error("failed while building '{technology}' dependency tree:\n{source}")]
    TreeBuild {
        technology: Technology,
        #[source]
        source: TreeBuildError,
    },
    #[error("failed while resolving the '{technology}' resolution repository: {source}")]
    Resolution {
        technology: Technology,
        #[source]
        source: ResolverError,
    },
    #[error("'{technology}' dependency tree scan request failed:\n{source}")]
    Scan {
        technology: Technology,
        #[source]
        source: ScanServiceError,
    },
    #[error("{0} is currently not supported")]
    UnsupportedTechnology(Technology),
    #[error("cannot derive the curation cache directory: {0}")]
    Curation(String),
    #[error("step '{step}' timed out after {timeout:?}")]
    Timeout { step: &'static str, timeout: Duration },
    #[error("the audit was cancelled")]
    Cancelled,
    #[error("cannot determine the current working directory: {0}")]
    WorkingDirectory(#[source] std::io::Error),
}

/// Where a pair was in its pipeline when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairStage {
    Pending,
    TreeBuilt,
    Flattened,
    Scanned,
    ImpactReconstructed,
    Done,
}

impl fmt::Display for PairStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PairStage::Pending => "pending",
            PairStage::TreeBuilt => "tree-built",
            PairStage::Flattened => "flattened",
            PairStage::Scanned => "scanned",
            PairStage::ImpactReconstructed => "impact-reconstructed",
            PairStage::Done => "done",
        };
        write!(f, "{}", name)
    }
}

/// A failed (technology, working directory) pair.
#[derive(Debug)]
pub struct PairFailure {
    pub technology: Technology,
    pub working_dir: PathBuf,
    /// Last stage the pair reached before failing.
    pub stage: PairStage,
    pub error: AuditError,
}

impl fmt::Display for PairFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} audit command in '{}' failed:\n{}",
            self.technology,
            self.working_dir.display(),
            self.error
        )
    }
}

/// Joined pair failures. Empty means every pair succeeded.
#[derive(Debug, Default)]
pub struct ScanErrors {
    failures: Vec<PairFailure>,
}

impl ScanErrors {
    pub fn push(&mut self, failure: PairFailure) {
        self.failures.push(failure);
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn failures(&self) -> &[PairFailure] {
        &self.failures
    }

    /// `Ok(())` when nothing failed.
    pub fn into_result(self) -> Result<(), ScanErrors> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for ScanErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, failure) in self.failures.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", failure)?;
        }
        Ok(())
    }
}

impl std::error::Error for ScanErrors {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_joined_errors_render_every_pair() {
        let mut errors = ScanErrors::default();
        assert!(errors.is_empty());
        errors.push(PairFailure {
            technology: Technology::Npm,
            working_dir: PathBuf::from("/work/web"),
            stage: PairStage::Pending,
            error: AuditError::NoDependencies,
        });
        errors.push(PairFailure {
            technology: Technology::Go,
            working_dir: PathBuf::from("/work/svc"),
            stage: PairStage::Flattened,
            error: AuditError::Cancelled,
        });
        let rendered = errors.to_string();
        assert!(rendered.contains("npm audit command in '/work/web' failed"));
        assert!(rendered.contains("no dependencies were found"));
        assert!(rendered.contains("go audit command in '/work/svc' failed"));
        assert!(errors.into_result().is_err());
    }
}
