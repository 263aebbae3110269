//! Report renderers for scan runs.
//!
//! - [`terminal`]: colored findings table with impact paths and a summary box.
//! - [`render_json`]: the results, candidates and failures as JSON.

use std::path::Path;

use anyhow::Result;
use serde::Serialize;

use crate::models::{Component, ImpactPathNode, ScaScanResult, Severity, Technology};
use crate::orchestrator::ScaRunReport;

pub mod terminal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindingKind {
    Vulnerability,
    Violation,
    License,
}

impl std::fmt::Display for FindingKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FindingKind::Vulnerability => write!(f, "vulnerability"),
            FindingKind::Violation => write!(f, "violation"),
            FindingKind::License => write!(f, "license"),
        }
    }
}

/// One flagged component of one issue, ready to print.
#[derive(Debug, Clone)]
pub struct Finding<'a> {
    pub technology: Technology,
    pub working_directory: &'a Path,
    pub kind: FindingKind,
    pub issue: &'a str,
    pub severity: Severity,
    pub component: &'a str,
    pub fixed_versions: &'a [String],
    pub impact_paths: &'a [Vec<ImpactPathNode>],
}

fn finding<'a>(
    result: &'a ScaScanResult,
    kind: FindingKind,
    issue: &'a str,
    severity: Severity,
    component: &'a str,
    details: &'a Component,
) -> Finding<'a> {
    Finding {
        technology: result.technology,
        working_directory: result.working_directory.as_path(),
        kind,
        issue,
        severity,
        component,
        fixed_versions: &details.fixed_versions,
        impact_paths: &details.impact_paths,
    }
}

/// Every finding of `results`, most severe first.
pub fn collect_findings(results: &[ScaScanResult]) -> Vec<Finding<'_>> {
    let mut findings = Vec::new();
    for result in results {
        for response in &result.scan_responses {
            for v in &response.vulnerabilities {
                for (id, c) in &v.components {
                    findings.push(finding(result, FindingKind::Vulnerability, &v.issue_id, v.severity, id, c));
                }
            }
            for v in &response.violations {
                for (id, c) in &v.components {
                    findings.push(finding(result, FindingKind::Violation, &v.issue_id, v.severity, id, c));
                }
            }
            for l in &response.licenses {
                for (id, c) in &l.components {
                    findings.push(finding(result, FindingKind::License, &l.key, Severity::Unknown, id, c));
                }
            }
        }
    }
    findings.sort_by(|a, b| b.severity.cmp(&a.severity).then_with(|| a.component.cmp(b.component)));
    findings
}

/// `a > b > c`
pub fn format_path(path: &[ImpactPathNode]) -> String {
    path.iter()
        .map(|n| n.component_id.as_str())
        .collect::<Vec<_>>()
        .join(" > ")
}

#[derive(Serialize)]
struct JsonFailure<'a> {
    technology: Technology,
    working_directory: &'a Path,
    stage: String,
    error: String,
}

#[derive(Serialize)]
struct JsonReport<'a> {
    results: &'a [ScaScanResult],
    applicability_candidates: &'a std::collections::BTreeMap<Technology, Vec<String>>,
    errors: Vec<JsonFailure<'a>>,
}

pub fn render_json(report: &ScaRunReport) -> Result<String> {
    let errors = report
        .errors
        .failures()
        .iter()
        .map(|f| JsonFailure {
            technology: f.technology,
            working_directory: &f.working_dir,
            stage: f.stage.to_string(),
            error: f.error.to_string(),
        })
        .collect();
    let json = JsonReport {
        results: &report.results,
        applicability_candidates: &report.applicability_candidates,
        errors,
    };
    Ok(serde_json::to_string_pretty(&json)?)
}
