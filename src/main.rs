//! `depaudit`: resolve dependency trees of every package manager found in a
//! project and scan them for vulnerable packages.
//!
//! # Flow
//! 1. Parse CLI arguments ([`cli`]).
//! 2. Load the tool config ([`depaudit::config::load_config`]) and merge it with the flags.
//! 3. Detect technologies and run one scan per working directory
//!    ([`depaudit::orchestrator::ScaOrchestrator`]).
//! 4. Render the report ([`depaudit::report`]).
//! 5. Exit `0` when every working directory was scanned, `1` otherwise.

mod cli;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;

use cli::{Cli, OutputFormat};
use depaudit::config::{load_config, AuditParams, Config, ServerDetails, DEFAULT_THREADS};
use depaudit::curation::CurationSettings;
use depaudit::models::Severity;
use depaudit::orchestrator::ScaOrchestrator;
use depaudit::resolver::RepositoryResolver;
use depaudit::scan::XrayClient;
use depaudit::{logging, report};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose, cli.quiet);

    let project = cli.paths.first().cloned().unwrap_or_else(|| ".".into());
    let config = load_config(&project, cli.config.as_deref())?;
    let curation = CurationSettings::from_env();
    let params = Arc::new(build_params(&cli, &config, &curation)?);

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling remaining scans");
            on_ctrl_c.cancel();
        }
    });

    let scanner = Arc::new(XrayClient::new(REQUEST_TIMEOUT)?);
    let orchestrator = ScaOrchestrator::new(params, scanner)
        .with_resolver(RepositoryResolver::new(dirs::home_dir().map(|h| h.join(".depaudit"))))
        .with_curation(curation)
        .with_cancellation(cancel);

    let spinner = if cli.quiet || matches!(cli.format, OutputFormat::Json) {
        None
    } else {
        let pb = ProgressBar::new_spinner();
        pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}")?);
        pb.set_message("Resolving and scanning dependencies...");
        pb.enable_steady_tick(Duration::from_millis(120));
        Some(pb)
    };

    let outcome = orchestrator.run().await;
    if let Some(pb) = spinner {
        pb.finish_and_clear();
    }
    let run = outcome?;

    match cli.format {
        OutputFormat::Terminal => report::terminal::render(&run, cli.verbose, cli.quiet)?,
        OutputFormat::Json => println!("{}", report::render_json(&run)?),
    }

    if !run.is_success() {
        std::process::exit(1);
    }
    Ok(())
}

/// Flags win over `[audit]` defaults from the config file.
fn build_params(cli: &Cli, config: &Config, curation: &CurationSettings) -> Result<AuditParams> {
    let server = match (&cli.url, &cli.server_id) {
        (Some(url), _) => Some(ServerDetails {
            server_id: "cli".to_string(),
            url: url.clone(),
            access_token: cli.access_token.clone(),
            ..Default::default()
        }),
        (None, Some(id)) => match config.server(Some(id.as_str())) {
            Some(server) => Some(server),
            None => bail!("server '{}' is not configured", id),
        },
        (None, None) => config.server(None),
    };

    let min_severity = match (cli.min_severity, &config.audit.min_severity) {
        (Some(severity), _) => Some(severity),
        (None, Some(raw)) => Some(
            raw.parse::<Severity>()
                .map_err(anyhow::Error::msg)
                .context("invalid [audit] min_severity")?,
        ),
        (None, None) => None,
    };

    let exclusions = if cli.exclusions.is_empty() {
        config.audit.exclusions.clone()
    } else {
        cli.exclusions.clone()
    };

    Ok(AuditParams {
        server,
        servers: config.servers.clone(),
        working_dirs: cli.paths.clone(),
        recursive: cli.recursive,
        technologies: cli.technologies.iter().map(|t| (*t).into()).collect(),
        exclusions,
        requirements_file: cli.requirements_file.clone(),
        npm_scope: cli.dep_type.into(),
        deps_repo: cli.deps_repo.clone(),
        ignore_config_file: cli.ignore_config,
        use_wrapper: cli.use_wrapper,
        min_severity,
        fixable_only: cli.fixable_only || config.audit.fixable_only.unwrap_or(false),
        curation: cli.curation || curation.enabled,
        third_party_applicability: cli.third_party_contextual_analysis,
        include_licenses: cli.licenses,
        project_key: cli.project_key.clone(),
        watches: cli.watches.clone(),
        threads: cli.threads.or(config.audit.threads).unwrap_or(DEFAULT_THREADS),
        timeout: cli.timeout.or(config.audit.timeout_secs).map(Duration::from_secs),
    })
}
