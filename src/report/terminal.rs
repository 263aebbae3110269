use anyhow::Result;
use colored::*;
use comfy_table::presets::UTF8_FULL;
use comfy_table::{Attribute, Cell, CellAlignment, Color, ContentArrangement, Table};

use crate::models::Severity;
use crate::orchestrator::ScaRunReport;

use super::{collect_findings, format_path, Finding};

/// Impact paths shown per finding unless `verbose`.
const MAX_PATHS: usize = 3;

/// Render a colored terminal report.
pub fn render(report: &ScaRunReport, verbose: bool, quiet: bool) -> Result<()> {
    let findings = collect_findings(&report.results);
    let count = |severity: Severity| findings.iter().filter(|f| f.severity == severity).count();
    let failed = report.errors.len();

    if quiet {
        println!(
            "Scanned: {}  Findings: {}  Critical: {}  High: {}  Failed: {}",
            report.results.len(),
            findings.len(),
            count(Severity::Critical).to_string().red(),
            count(Severity::High).to_string().yellow(),
            failed.to_string().red(),
        );
        return Ok(());
    }

    println!("\n {} v{}\n", "depaudit".bold(), env!("CARGO_PKG_VERSION"));

    println!(" ┌────────────────────────────────────────────────────┐");
    println!(" │  {:<48} │", "SUMMARY".bold());
    println!(" │  {:<48} │", format!("Working directories scanned : {}", report.results.len()));
    println!(" │  {:<48} │", format!("Findings                    : {}", findings.len()));
    println!(
        " │  {:<48} │",
        format!(
            "{}  Critical / High           : {:>3} / {:<3}",
            "✗".red(),
            count(Severity::Critical),
            count(Severity::High)
        )
    );
    println!(
        " │  {:<48} │",
        format!(
            "{}  Medium / Low / Unknown    : {:>3} / {} / {}",
            "⚠".yellow(),
            count(Severity::Medium),
            count(Severity::Low),
            count(Severity::Unknown)
        )
    );
    println!(" └────────────────────────────────────────────────────┘\n");

    if findings.is_empty() {
        println!(" {} No findings.\n", "✓".green());
    } else {
        render_table(&findings, verbose);
        println!();
    }

    if verbose {
        render_results(report);
    }

    if failed > 0 {
        println!(" {} {} working director{} could not be scanned:\n", "[ERROR]".red().bold(), failed, if failed == 1 { "y" } else { "ies" });
        for failure in report.errors.failures() {
            println!("   {}", failure.to_string().replace('\n', "\n   ").red());
        }
        println!();
    }

    Ok(())
}

fn severity_color(severity: Severity) -> Color {
    match severity {
        Severity::Critical => Color::Red,
        Severity::High => Color::DarkRed,
        Severity::Medium => Color::Yellow,
        Severity::Low => Color::Green,
        Severity::Unknown => Color::DarkGrey,
    }
}

fn render_table(findings: &[Finding<'_>], verbose: bool) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Severity").add_attribute(Attribute::Bold),
            Cell::new("Issue").add_attribute(Attribute::Bold),
            Cell::new("Component").add_attribute(Attribute::Bold),
            Cell::new("Fixed in").add_attribute(Attribute::Bold),
            Cell::new("Technology").add_attribute(Attribute::Bold),
            Cell::new("Impact paths").add_attribute(Attribute::Bold),
        ]);

    for finding in findings {
        let mut paths: Vec<String> = finding
            .impact_paths
            .iter()
            .take(if verbose { usize::MAX } else { MAX_PATHS })
            .map(|p| format_path(p))
            .collect();
        let hidden = finding.impact_paths.len().saturating_sub(paths.len());
        if hidden > 0 {
            paths.push(format!("(+{} more)", hidden));
        }

        table.add_row(vec![
            Cell::new(finding.severity.to_string())
                .fg(severity_color(finding.severity))
                .set_alignment(CellAlignment::Center),
            Cell::new(format!("{} ({})", finding.issue, finding.kind)),
            Cell::new(finding.component),
            Cell::new(finding.fixed_versions.join(", ")),
            Cell::new(finding.technology.to_string()),
            Cell::new(paths.join("\n")),
        ]);
    }

    println!("{}", table);
}

fn render_results(report: &ScaRunReport) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Technology").add_attribute(Attribute::Bold),
            Cell::new("Working directory").add_attribute(Attribute::Bold),
            Cell::new("Descriptors").add_attribute(Attribute::Bold),
            Cell::new("Multiple roots").add_attribute(Attribute::Bold),
        ]);
    for result in &report.results {
        let descriptors: Vec<String> = result
            .descriptors
            .iter()
            .filter_map(|d| d.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect();
        let multiple = match result.is_multiple_root_project {
            Some(true) => "yes",
            Some(false) => "no",
            None => "-",
        };
        table.add_row(vec![
            Cell::new(result.technology.to_string()),
            Cell::new(result.working_directory.display().to_string()),
            Cell::new(descriptors.join(", ")),
            Cell::new(multiple).set_alignment(CellAlignment::Center),
        ]);
    }
    println!(" {} Scanned working directories:\n", "[INFO]".cyan().bold());
    println!("{}\n", table);
}
