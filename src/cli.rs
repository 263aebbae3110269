use std::path::PathBuf;

use clap::Parser;

use depaudit::config::NpmScope;
use depaudit::models::{Severity, Technology};

#[derive(Parser, Debug)]
#[command(
    name = "depaudit",
    about = "Resolve project dependency trees and scan them for vulnerable packages",
    version
)]
pub struct Cli {
    /// Directories to audit
    #[arg(default_value = ".")]
    pub paths: Vec<PathBuf>,

    /// Only audit these technologies (repeatable)
    #[arg(long = "tech", value_name = "TECH")]
    pub technologies: Vec<TechnologyArg>,

    /// Look for working directories below the given paths
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set, value_name = "BOOL")]
    pub recursive: bool,

    /// Wildcard patterns of paths to skip, separated by ';'
    #[arg(long, value_name = "PATTERNS", value_delimiter = ';')]
    pub exclusions: Vec<String>,

    /// Pip requirements file to install from
    #[arg(long, value_name = "FILE")]
    pub requirements_file: Option<String>,

    /// npm dependency kinds to include
    #[arg(long, value_name = "TYPE", default_value = "all")]
    pub dep_type: DepTypeArg,

    /// Resolve every technology through this repository
    #[arg(long, value_name = "REPO")]
    pub deps_repo: Option<String>,

    /// Ignore .depaudit/projects/<tech>.yaml resolution configs
    #[arg(long = "ignore-config")]
    pub ignore_config: bool,

    /// Server from the config file to use
    #[arg(long, value_name = "ID")]
    pub server_id: Option<String>,

    /// Platform URL, overriding the configured server
    #[arg(long, value_name = "URL")]
    pub url: Option<String>,

    /// Access token for --url
    #[arg(long, value_name = "TOKEN")]
    pub access_token: Option<String>,

    /// Drop findings below this severity
    #[arg(long, value_name = "SEVERITY")]
    pub min_severity: Option<Severity>,

    /// Only report findings that have a fixed version
    #[arg(long)]
    pub fixable_only: bool,

    /// Resolve in curation mode and record download URLs
    #[arg(long)]
    pub curation: bool,

    /// Hand every dependency to third-party applicability analysis
    #[arg(long = "third-party-contextual-analysis")]
    pub third_party_contextual_analysis: bool,

    /// Also request license information
    #[arg(long)]
    pub licenses: bool,

    /// Working directories scanned concurrently [default: 3]
    #[arg(long, value_name = "N")]
    pub threads: Option<usize>,

    /// Timeout in seconds for each tree build and each scan
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Use the Maven and Gradle wrappers when present
    #[arg(long)]
    pub use_wrapper: bool,

    /// Project key for policy violations
    #[arg(long = "project", value_name = "KEY")]
    pub project_key: Option<String>,

    /// Watches for policy violations, separated by ','
    #[arg(long, value_name = "WATCHES", value_delimiter = ',')]
    pub watches: Vec<String>,

    /// Output format
    #[arg(long, default_value = "terminal", value_name = "FORMAT")]
    pub format: OutputFormat,

    /// Config file [default: ./.depaudit/config.toml, fallback ~/.config/depaudit/config.toml]
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Debug logging and every impact path
    #[arg(short, long)]
    pub verbose: bool,

    /// Only print the summary line
    #[arg(short, long)]
    pub quiet: bool,
}

#[derive(Debug, Clone, clap::ValueEnum)]
pub enum OutputFormat {
    Terminal,
    Json,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum DepTypeArg {
    All,
    DevOnly,
    ProdOnly,
}

impl From<DepTypeArg> for NpmScope {
    fn from(arg: DepTypeArg) -> Self {
        match arg {
            DepTypeArg::All => NpmScope::All,
            DepTypeArg::DevOnly => NpmScope::DevOnly,
            DepTypeArg::ProdOnly => NpmScope::ProdOnly,
        }
    }
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum TechnologyArg {
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

impl From<TechnologyArg> for Technology {
    fn from(arg: TechnologyArg) -> Self {
        match arg {
            TechnologyArg::Maven => Technology::Maven,
            TechnologyArg::Gradle => Technology::Gradle,
            TechnologyArg::Npm => Technology::Npm,
            TechnologyArg::Yarn => Technology::Yarn,
            TechnologyArg::Go => Technology::Go,
            TechnologyArg::Pip => Technology::Pip,
            TechnologyArg::Pipenv => Technology::Pipenv,
            TechnologyArg::Poetry => Technology::Poetry,
            TechnologyArg::Nuget => Technology::Nuget,
            TechnologyArg::Dotnet => Technology::Dotnet,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flags() {
        let cli = Cli::try_parse_from([
            "depaudit",
            "web",
            "svc",
            "--tech",
            "npm",
            "--tech",
            "go",
            "--exclusions",
            "*dist*;*build*",
            "--dep-type",
            "prod-only",
            "--min-severity",
            "high",
            "--watches",
            "prod,legal",
            "--recursive",
            "false",
        ])
        .unwrap();
        assert_eq!(cli.paths, vec![PathBuf::from("web"), PathBuf::from("svc")]);
        let techs: Vec<Technology> = cli.technologies.into_iter().map(Into::into).collect();
        assert_eq!(techs, vec![Technology::Npm, Technology::Go]);
        assert_eq!(cli.exclusions, vec!["*dist*", "*build*"]);
        assert_eq!(NpmScope::from(cli.dep_type), NpmScope::ProdOnly);
        assert_eq!(cli.min_severity, Some(Severity::High));
        assert_eq!(cli.watches, vec!["prod", "legal"]);
        assert!(!cli.recursive);
    }

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["depaudit"]).unwrap();
        assert_eq!(cli.paths, vec![PathBuf::from(".")]);
        assert!(cli.recursive);
        assert!(cli.threads.is_none());
        assert!(matches!(cli.format, OutputFormat::Terminal));
    }
}
