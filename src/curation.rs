//! Cache locations for curation mode.
//!
//! Curation installs packages through the curated repository only, so every
//! project and technology gets its own cache directory to keep artifacts of
//! concurrent scans apart.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::AuditError;
use crate::models::Technology;

pub const CURATION_DIR_ENV: &str = "DEPAUDIT_CURATION_DIR";
pub const CURATION_FLAG_ENV: &str = "DEPAUDIT_CURATION";

const CURATION_DIR_NAME: &str = "curation";

/// Curation settings read from the environment once at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CurationSettings {
    /// Value of `DEPAUDIT_CURATION_DIR`.
    pub dir_override: Option<PathBuf>,
    /// Value of `DEPAUDIT_CURATION`.
    pub enabled: bool,
}

impl CurationSettings {
    pub fn from_env() -> Self {
        let dir_override = std::env::var_os(CURATION_DIR_ENV)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        let enabled = std::env::var(CURATION_FLAG_ENV)
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes"))
            .unwrap_or(false);
        Self { dir_override, enabled }
    }

    /// `$DEPAUDIT_CURATION_DIR`, or `~/.depaudit/curation`.
    pub fn root(&self) -> Result<PathBuf, AuditError> {
        if let Some(dir) = &self.dir_override {
            return Ok(dir.clone());
        }
        let home = dirs::home_dir()
            .ok_or_else(|| AuditError::Curation("home directory is unknown".to_string()))?;
        Ok(home.join(".depaudit").join(CURATION_DIR_NAME))
    }

    pub fn cache_dir(&self) -> Result<PathBuf, AuditError> {
        Ok(self.root()?.join("cache"))
    }

    /// `<root>/cache/<tech>/<sha256 of project_dir>`.
    ///
    /// `project_dir` must be absolute so the same project always maps to
    /// the same directory regardless of how it was named on the command line.
    pub fn cache_dir_for(&self, technology: Technology, project_dir: &Path) -> Result<PathBuf, AuditError> {
        if !project_dir.is_absolute() {
            return Err(AuditError::Curation(format!(
                "{} is not an absolute path",
                project_dir.display()
            )));
        }
        Ok(self
            .cache_dir()?
            .join(technology.as_str())
            .join(project_path_hash(project_dir)))
    }

    /// Shared pip download cache, `<root>/cache/pip`.
    pub fn pip_cache_dir(&self) -> Result<PathBuf, AuditError> {
        Ok(self.cache_dir()?.join("pip"))
    }
}

fn project_path_hash(path: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.to_string_lossy().as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_settings_from_env() {
        std::env::set_var(CURATION_DIR_ENV, "/tmp/curated");
        std::env::set_var(CURATION_FLAG_ENV, "TRUE");
        let settings = CurationSettings::from_env();
        assert_eq!(settings.dir_override, Some(PathBuf::from("/tmp/curated")));
        assert!(settings.enabled);

        std::env::remove_var(CURATION_DIR_ENV);
        std::env::remove_var(CURATION_FLAG_ENV);
        let settings = CurationSettings::from_env();
        assert_eq!(settings, CurationSettings::default());
    }

    #[test]
    fn test_cache_dir_is_stable_and_scoped() {
        let settings = CurationSettings {
            dir_override: Some(PathBuf::from("/var/cache/depaudit")),
            enabled: true,
        };
        let project = Path::new("/work/project-a");
        let first = settings.cache_dir_for(Technology::Npm, project).unwrap();
        let second = settings.cache_dir_for(Technology::Npm, project).unwrap();
        assert_eq!(first, second);
        assert!(first.starts_with("/var/cache/depaudit/cache/npm"));
        assert_eq!(first.file_name().unwrap().len(), 64);

        let other_tech = settings.cache_dir_for(Technology::Maven, project).unwrap();
        let other_project = settings
            .cache_dir_for(Technology::Npm, Path::new("/work/project-b"))
            .unwrap();
        assert_ne!(first, other_tech);
        assert_ne!(first, other_project);
        assert_eq!(
            settings.pip_cache_dir().unwrap(),
            PathBuf::from("/var/cache/depaudit/cache/pip")
        );
    }

    #[test]
    fn test_relative_project_dir_is_rejected() {
        let settings = CurationSettings {
            dir_override: Some(PathBuf::from("/c")),
            enabled: true,
        };
        assert!(settings.cache_dir_for(Technology::Go, Path::new("relative")).is_err());
    }
}
