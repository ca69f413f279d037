//! Test runner implementation
//!
//! Loads a scenario file, resolves it against the shared asset registry and
//! drives it through the scenario engine. The colored report is collected
//! per scenario so concurrent runs print as whole blocks.

use std::path::Path;
use std::sync::Arc;

use colored::Colorize;

use crate::archive::ArchiveExtractor;
use crate::assets::{AssetRegistry, AssetStore};
use crate::common::config::Config;
use crate::common::Result;
use crate::scenario::{ScenarioContext, ScenarioOutcome};
use crate::vm::VmController;

use super::config::ScenarioFile;

/// Result of a test run
#[derive(Debug)]
pub struct TestResult {
    pub name: String,
    pub passed: bool,
    pub steps_run: usize,
    pub steps_total: usize,
    pub error: Option<String>,
    /// Rendered step-by-step report, ready to print
    pub report: String,
}

/// Lines of one scenario's report
#[derive(Debug, Default)]
struct Report {
    lines: Vec<String>,
}

impl Report {
    fn line(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }

    fn finish(self) -> String {
        let mut text = self.lines.join("\n");
        text.push('\n');
        text
    }
}

/// Everything scenarios share within one process
#[derive(Clone)]
pub struct Harness {
    pub store: Arc<AssetStore>,
    pub extractor: Arc<ArchiveExtractor>,
    pub controller: Arc<dyn VmController>,
    pub registry: Arc<AssetRegistry>,
    pub config: Arc<Config>,
}

/// Run a test scenario from a YAML file
///
/// Nothing is printed; the caller prints [`TestResult::report`].
pub async fn run_scenario(path: &Path, harness: &Harness, verbose: bool) -> Result<TestResult> {
    let file = ScenarioFile::load(path)?;
    let description = file.description.clone();
    let scenario = file.into_scenario(&harness.registry, &harness.config)?;
    let steps_total = scenario.steps.len();

    let mut report = Report::default();
    report.line(format!(
        "\n{} {}",
        "Running Test:".blue().bold(),
        scenario.name.white().bold()
    ));
    if let Some(desc) = &description {
        report.line(format!("  {}", desc.dimmed()));
    }
    report.line(format!("\n{}", "Steps:".cyan()));

    let ctx = ScenarioContext::new(
        &harness.store,
        &harness.extractor,
        harness.controller.as_ref(),
        &harness.config,
    );
    let outcome = scenario
        .run_with(&ctx, |index, step| {
            if verbose {
                report.line(format!("  {} Step {}: {}", "→".dimmed(), index + 1, step.describe()));
            }
        })
        .await;

    match outcome {
        ScenarioOutcome::Success { steps_run } => {
            for (i, step) in scenario.steps.iter().enumerate() {
                report.line(format!("  {} Step {}: {}", "✓".green(), i + 1, step.describe().dimmed()));
            }
            report.line(format!(
                "\n{} {}",
                "✓".green().bold(),
                "Test Passed".green().bold()
            ));
            Ok(TestResult {
                name: scenario.name,
                passed: true,
                steps_run,
                steps_total,
                error: None,
                report: report.finish(),
            })
        }
        ScenarioOutcome::Failure {
            step_index,
            error,
            console_tail,
            exit_code,
        } => {
            for (i, step) in scenario.steps.iter().enumerate().take(step_index) {
                report.line(format!("  {} Step {}: {}", "✓".green(), i + 1, step.describe().dimmed()));
            }
            report.line(format!(
                "  {} Step {}: {} {}",
                "✗".red(),
                step_index + 1,
                error,
                format!("[{}]", error.category()).dimmed()
            ));
            if let Some(code) = exit_code {
                report.line(format!("    {} {}", "VM exit code:".yellow(), code));
            }
            // Console errors already print their tail
            let tail = console_tail.filter(|t| !t.is_empty() && error.console_tail().is_none());
            if let Some(tail) = tail {
                report.line(format!("    {}", "Console tail:".yellow()));
                for line in tail.lines() {
                    report.line(format!("    | {}", line.dimmed()));
                }
            }
            Ok(TestResult {
                name: scenario.name,
                passed: false,
                steps_run: step_index + 1,
                steps_total,
                error: Some(error.to_string()),
                report: report.finish(),
            })
        }
    }
}
