//! CLI command implementations.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use harness::config::{HarnessConfig, load_config};
use harness::gateway::GatewaySession;
use harness::{HarnessError, exit_codes, mode};
use tracing::{debug, info};

use crate::case::{discover_cases, select_cases, validate_case_id};
use crate::outcome::Outcome;
use crate::report::aggregate;
use crate::suite::{SuitePaths, run_suite};

fn validation_dir(project_root: &Path) -> PathBuf {
    project_root.join("validation")
}

fn cases_dir(project_root: &Path) -> PathBuf {
    validation_dir(project_root).join("cases")
}

fn results_base(project_root: &Path) -> PathBuf {
    validation_dir(project_root).join("results")
}

/// List all available cases.
pub fn list_cases(project_root: &Path) -> Result<i32> {
    for case in discover_cases(&cases_dir(project_root))? {
        let meta = &case.file.case;
        println!(
            "{} gateway_only={} turns={}{}",
            meta.id,
            meta.gateway_only,
            case.file.input().turn_count(),
            meta.description
                .as_deref()
                .map(|description| format!(" description={description:?}"))
                .unwrap_or_default()
        );
    }
    Ok(exit_codes::OK)
}

/// Run the selected cases (all when none are named) in one gateway session.
pub fn run_cases(
    project_root: &Path,
    mode_flag: Option<String>,
    case_ids: &[String],
) -> Result<i32> {
    let selector = mode::selector_from_env(mode_flag);
    let template = mode::resolve(selector.as_deref(), project_root)?;

    let cases = select_cases(discover_cases(&cases_dir(project_root))?, case_ids)
        .map_err(|err| HarnessError::config(format!("{err:#}")))?;
    if cases.is_empty() {
        println!("run: no cases found in {}", cases_dir(project_root).display());
        return Ok(exit_codes::OK);
    }

    let config = load_config(&HarnessConfig::path(project_root))
        .map_err(|err| HarnessError::config(format!("{err:#}")))?;
    debug!(cases = cases.len(), mode = %template.mode(), "cases loaded");

    info!(mode = %template.mode(), "opening gateway session");
    let session = GatewaySession::open(template, &config)?;
    let results_dir = results_base(project_root);
    let paths = SuitePaths {
        project_root,
        results_dir: &results_dir,
    };
    let report = run_suite(session, &config, &cases, paths)?;

    for case in &report.cases {
        println!(
            "run: case={} run_id={} outcome={:?} results={}",
            case.case_id,
            report.run_id,
            case.outcome,
            case.results_dir.display()
        );
        if let Some(error) = &case.error {
            println!("run: case={} error={error:?}", case.case_id);
        }
    }
    println!(
        "run: run_id={} pass={} fail={} error={} skipped={}",
        report.run_id,
        report.count(Outcome::Pass),
        report.count(Outcome::Fail),
        report.count(Outcome::Error),
        report.count(Outcome::Skipped)
    );

    Ok(if report.has_failures() {
        exit_codes::AGENT_FAILED
    } else {
        exit_codes::OK
    })
}

/// Show aggregated results for a case.
pub fn report_case(project_root: &Path, case_id: &str) -> Result<i32> {
    validate_case_id(case_id)?;
    let (summary, warnings) = aggregate(&results_base(project_root).join(case_id))?;
    println!("report: case={} runs={}", case_id, summary.runs);
    println!(
        "report: pass={} fail={} error={} skipped={}",
        summary.pass, summary.fail, summary.error, summary.skipped
    );
    if let Some(avg) = summary.avg_duration_secs {
        println!("report: avg_duration_secs={avg:.2}");
    }
    for (label, (passed, total)) in summary.check_pass_rates {
        println!("report: check {label} {passed}/{total}");
    }
    for warning in warnings {
        eprintln!("warning: {warning}");
    }
    Ok(exit_codes::OK)
}

/// Remove captured results for a case.
pub fn clean_case(project_root: &Path, case_id: &str) -> Result<i32> {
    validate_case_id(case_id)?;
    let case_results = results_base(project_root).join(case_id);
    let existed = case_results.exists();
    if existed {
        std::fs::remove_dir_all(&case_results)
            .with_context(|| format!("remove {}", case_results.display()))?;
    }
    println!(
        "clean: case={} results={} removed={}",
        case_id,
        case_results.display(),
        existed
    );
    Ok(exit_codes::OK)
}
