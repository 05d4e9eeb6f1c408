use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::judge::Judgment;
use crate::outcome::Outcome;
use crate::results::read_meta;

#[derive(Debug, Default)]
pub struct ReportSummary {
    pub runs: usize,
    pub pass: usize,
    pub fail: usize,
    pub error: usize,
    pub skipped: usize,
    /// Average over runs that reached the agent (skipped runs excluded).
    pub avg_duration_secs: Option<f64>,
    pub check_pass_rates: BTreeMap<String, (usize, usize)>,
}

/// Run directories of one case, oldest first (run ids sort by timestamp).
pub fn load_run_dirs(case_results_dir: &Path) -> Result<Vec<PathBuf>> {
    if !case_results_dir.exists() {
        return Ok(Vec::new());
    }
    let entries = fs::read_dir(case_results_dir)
        .with_context(|| format!("read {}", case_results_dir.display()))?;
    let mut dirs = entries
        .map(|entry| entry.map(|entry| entry.path()).context("read entry"))
        .filter(|path| !matches!(path, Ok(path) if !path.is_dir()))
        .collect::<Result<Vec<_>>>()?;
    dirs.sort();
    Ok(dirs)
}

fn read_judgment(path: &Path) -> Result<Judgment> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).context("parse checks")
}

pub fn aggregate(case_results_dir: &Path) -> Result<(ReportSummary, Vec<String>)> {
    let mut summary = ReportSummary::default();
    let mut warnings = Vec::new();
    let mut timed_runs = 0usize;
    let mut total_duration = 0.0;

    for run_dir in load_run_dirs(case_results_dir)? {
        let meta = match read_meta(&run_dir.join("meta.json")) {
            Ok(meta) => meta,
            Err(err) => {
                warnings.push(format!(
                    "skip {}: meta.json invalid ({err:#})",
                    run_dir.display()
                ));
                continue;
            }
        };

        let judgment = match read_judgment(&run_dir.join("checks.json")) {
            Ok(judgment) => judgment,
            Err(err) => {
                warnings.push(format!(
                    "skip {}: checks.json invalid ({err:#})",
                    run_dir.display()
                ));
                continue;
            }
        };

        summary.runs += 1;
        match meta.outcome {
            Outcome::Pass => summary.pass += 1,
            Outcome::Fail => summary.fail += 1,
            Outcome::Error => summary.error += 1,
            Outcome::Skipped => summary.skipped += 1,
        }

        if meta.outcome != Outcome::Skipped {
            timed_runs += 1;
            total_duration += meta.duration_secs;
            summary.avg_duration_secs = Some(total_duration / timed_runs as f64);
        }

        update_check_pass_rates(&mut summary.check_pass_rates, &judgment);
    }

    Ok((summary, warnings))
}

fn update_check_pass_rates(stats: &mut BTreeMap<String, (usize, usize)>, judgment: &Judgment) {
    for check in &judgment.checks {
        let entry = stats.entry(check.label()).or_insert((0, 0));
        if check.passed() {
            entry.0 += 1;
        }
        entry.1 += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::judge::CheckOutcome;
    use crate::results::RunMeta;
    use harness::mode::ExecutionMode;
    use tempfile::tempdir;

    fn write_run(dir: &Path, outcome: Outcome, duration: f64, passed: Option<bool>) {
        fs::create_dir_all(dir).expect("run dir");
        let meta = RunMeta {
            case_id: "case".to_string(),
            run_id: "run".to_string(),
            case_hash: "hash".to_string(),
            project_git_sha: None,
            mode: ExecutionMode::Direct,
            gateway_address: None,
            outcome,
            start_time: "now".to_string(),
            end_time: "later".to_string(),
            duration_secs: duration,
            exit_code: Some(0),
            error: None,
            capture_errors: Vec::new(),
        };
        let contents = serde_json::to_string_pretty(&meta).expect("meta json");
        fs::write(dir.join("meta.json"), format!("{contents}\n")).expect("write meta");

        let judgment = Judgment {
            checks: passed
                .map(|passed| CheckOutcome::ToolCalled {
                    name: "Read".to_string(),
                    passed,
                })
                .into_iter()
                .collect(),
        };
        let contents = serde_json::to_string_pretty(&judgment).expect("checks json");
        fs::write(dir.join("checks.json"), format!("{contents}\n")).expect("write checks");
    }

    #[test]
    fn aggregates_runs() {
        let temp = tempdir().expect("tempdir");
        write_run(&temp.path().join("run1"), Outcome::Pass, 5.0, Some(true));
        write_run(&temp.path().join("run2"), Outcome::Fail, 15.0, Some(false));
        write_run(&temp.path().join("run3"), Outcome::Skipped, 0.0, None);

        let (summary, warnings) = aggregate(temp.path()).expect("aggregate");
        assert!(warnings.is_empty());
        assert_eq!(summary.runs, 3);
        assert_eq!(summary.pass, 1);
        assert_eq!(summary.fail, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.avg_duration_secs, Some(10.0));
        assert_eq!(
            summary.check_pass_rates.get("tool_called(Read)"),
            Some(&(1, 2))
        );
    }

    #[test]
    fn invalid_runs_become_warnings() {
        let temp = tempdir().expect("tempdir");
        write_run(&temp.path().join("run1"), Outcome::Error, 2.0, None);
        let broken = temp.path().join("run2");
        fs::create_dir_all(&broken).expect("broken");
        fs::write(broken.join("meta.json"), "{").expect("broken meta");

        let (summary, warnings) = aggregate(temp.path()).expect("aggregate");
        assert_eq!(summary.runs, 1);
        assert_eq!(summary.error, 1);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("meta.json invalid"));
    }

    #[test]
    fn missing_case_dir_is_empty() {
        let temp = tempdir().expect("tempdir");
        let (summary, warnings) = aggregate(&temp.path().join("nope")).expect("aggregate");
        assert_eq!(summary.runs, 0);
        assert!(summary.avg_duration_secs.is_none());
        assert!(warnings.is_empty());
    }
}
