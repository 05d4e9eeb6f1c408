//! Suite execution orchestration.
//!
//! One gateway session serves every case of a run. For each case: fixtures
//! are prepared, the runner is called, checks are judged, and results are
//! captured. Setup failures abort the run; a failed call only fails its case.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use harness::HarnessError;
use harness::config::HarnessConfig;
use harness::gateway::GatewaySession;
use harness::result::RunnerResult;
use tracing::{info, instrument, warn};

use crate::case::{CaseFile, CaseInput, DiscoveredCase};
use crate::config::{apply_case_config, check_timeout};
use crate::fixtures::{self, FixturePaths};
use crate::judge::{CommandLimits, Judgment, run_checks};
use crate::outcome::{Outcome, classify_outcome};
use crate::results::{CaptureInput, capture_results, new_run_id};

/// Where a suite run reads fixtures and writes results.
#[derive(Debug, Clone, Copy)]
pub struct SuitePaths<'a> {
    pub project_root: &'a Path,
    /// Base of `<case_id>/<run_id>/` result directories.
    pub results_dir: &'a Path,
}

/// Result of one case within a suite run.
#[derive(Debug)]
pub struct CaseReport {
    pub case_id: String,
    pub outcome: Outcome,
    pub results_dir: PathBuf,
    pub error: Option<String>,
}

/// Result of a whole suite run.
#[derive(Debug)]
pub struct SuiteReport {
    pub run_id: String,
    pub cases: Vec<CaseReport>,
}

impl SuiteReport {
    pub fn count(&self, outcome: Outcome) -> usize {
        self.cases
            .iter()
            .filter(|case| case.outcome == outcome)
            .count()
    }

    pub fn has_failures(&self) -> bool {
        self.cases.iter().any(|case| case.outcome.is_failure())
    }
}

/// How a single case ended before capture.
enum Execution {
    Skipped,
    Errored {
        message: String,
        result: Option<RunnerResult>,
    },
    Judged {
        result: RunnerResult,
        judgment: Judgment,
    },
}

/// Run `cases` in order against `session`, then close the session.
///
/// The session is closed on every path, including aborts.
#[instrument(skip_all, fields(mode = %session.mode_config().mode(), cases = cases.len()))]
pub fn run_suite(
    session: GatewaySession,
    config: &HarnessConfig,
    cases: &[DiscoveredCase],
    paths: SuitePaths<'_>,
) -> Result<SuiteReport> {
    let run_id = new_run_id();
    info!(run_id = %run_id, "suite run started");

    let mut reports = Vec::with_capacity(cases.len());
    let mut aborted = None;
    for case in cases {
        match run_case(&session, config, case, paths, &run_id) {
            Ok(report) => reports.push(report),
            Err(err) => {
                aborted = Some(err);
                break;
            }
        }
    }

    let closed = session.close();
    if let Some(err) = aborted {
        return Err(err.context(format!("suite run {run_id} aborted")));
    }
    closed.context("stop gateway")?;

    info!(run_id = %run_id, "suite run complete");
    Ok(SuiteReport {
        run_id,
        cases: reports,
    })
}

#[instrument(skip_all, fields(case_id = %case.id()))]
fn run_case(
    session: &GatewaySession,
    config: &HarnessConfig,
    case: &DiscoveredCase,
    paths: SuitePaths<'_>,
    run_id: &str,
) -> Result<CaseReport> {
    let started_at = Utc::now();
    let execution = execute(session, config, &case.file, paths.project_root)?;
    let finished_at = Utc::now();

    let empty = Judgment::default();
    let (outcome, result, judgment, error) = match &execution {
        Execution::Skipped => (Outcome::Skipped, None, &empty, None),
        Execution::Errored { message, result } => {
            (Outcome::Error, result.as_ref(), &empty, Some(message.clone()))
        }
        Execution::Judged { result, judgment } => {
            (classify_outcome(judgment), Some(result), judgment, None)
        }
    };

    let mode_config = session.mode_config();
    let capture = CaptureInput {
        case_id: case.id(),
        case_path: &case.path,
        run_id,
        mode: mode_config.mode(),
        gateway_address: mode_config.gateway_address(),
        outcome,
        started_at,
        finished_at,
        result,
        error: error.clone(),
        judgment,
        project_root: paths.project_root,
    };
    let results_dir = capture_results(paths.results_dir, &capture).context("capture results")?;

    info!(outcome = ?outcome, results_dir = %results_dir.display(), "case complete");
    Ok(CaseReport {
        case_id: case.id().to_string(),
        outcome,
        results_dir,
        error,
    })
}

/// Only session-fatal failures are returned as errors.
fn execute(
    session: &GatewaySession,
    base: &HarnessConfig,
    file: &CaseFile,
    project_root: &Path,
) -> Result<Execution> {
    if file.case.gateway_only && !session.mode_config().mode().uses_gateway() {
        info!("gateway-only case skipped in direct mode");
        return Ok(Execution::Skipped);
    }

    let config = apply_case_config(base, &file.case)
        .map_err(|err| HarnessError::config(format!("case {}: {err:#}", file.case.id)))?;

    let fixture_paths = match fixtures::prepare(project_root, &file.fixtures) {
        Ok(fixture_paths) => fixture_paths,
        Err(err) => {
            return Ok(Execution::Errored {
                message: format!("prepare fixtures: {err:#}"),
                result: None,
            });
        }
    };
    let execution = call_and_judge(session, &config, file, &fixture_paths);
    if let Err(err) = fixtures::cleanup(&fixture_paths) {
        warn!(err = %format!("{err:#}"), "fixture cleanup failed");
    }
    execution
}

fn call_and_judge(
    session: &GatewaySession,
    config: &HarnessConfig,
    file: &CaseFile,
    fixture_paths: &FixturePaths,
) -> Result<Execution> {
    let input = match substitute_input(file.input(), fixture_paths) {
        Ok(input) => input,
        Err(err) => {
            return Ok(Execution::Errored {
                message: format!("{err:#}"),
                result: None,
            });
        }
    };

    let call = session.runner(config).and_then(|runner| match &input {
        CaseInput::Oneshot(prompt) => runner.oneshot(prompt),
        CaseInput::Repl(turns) => runner.repl(turns.iter().map(String::as_str)),
    });
    let result = match call {
        Ok(result) => result,
        Err(err) if err.is_session_fatal() => return Err(err.into()),
        Err(err) => {
            warn!(err = %err, "runner call failed");
            return Ok(Execution::Errored {
                message: err.to_string(),
                result: None,
            });
        }
    };

    let limits = CommandLimits {
        timeout: check_timeout(config),
        ..CommandLimits::default_limits()
    };
    Ok(match run_checks(&file.checks, &result, fixture_paths, limits) {
        Ok(judgment) => Execution::Judged { result, judgment },
        Err(err) => Execution::Errored {
            message: format!("run checks: {err:#}"),
            result: Some(result),
        },
    })
}

fn substitute_input(input: CaseInput, paths: &FixturePaths) -> Result<CaseInput> {
    Ok(match input {
        CaseInput::Oneshot(prompt) => CaseInput::Oneshot(paths.substitute(&prompt)?),
        CaseInput::Repl(turns) => CaseInput::Repl(
            turns
                .iter()
                .map(|turn| paths.substitute(turn))
                .collect::<Result<_>>()?,
        ),
    })
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::case::CaseFile;
    use crate::results::read_meta;
    use harness::mode::resolve;
    use harness::test_support::{CountingGateway, echo_agent, spawn_ws_gateway};
    use tempfile::tempdir;

    fn write_case(root: &Path, id: &str, body: &str) -> DiscoveredCase {
        let dir = root.join("validation").join("cases");
        fs::create_dir_all(&dir).expect("cases dir");
        let path = dir.join(format!("{id}.toml"));
        fs::write(&path, format!("[case]\nid = \"{id}\"\n{body}")).expect("write case");
        let file = CaseFile::load(&path).expect("load case");
        DiscoveredCase { path, file }
    }

    fn suite_paths(root: &Path) -> (PathBuf, PathBuf) {
        (root.to_path_buf(), root.join("validation").join("results"))
    }

    fn outcomes(report: &SuiteReport) -> Vec<(&str, Outcome)> {
        report
            .cases
            .iter()
            .map(|case| (case.case_id.as_str(), case.outcome))
            .collect()
    }

    #[test]
    fn gateway_suite_shares_one_session() {
        let temp = tempdir().expect("tempdir");
        let server = spawn_ws_gateway(echo_agent);
        let cases = vec![
            write_case(
                temp.path(),
                "echo-oneshot",
                r#"prompt = "hello from {scratch}"
[[checks]]
type = "output_contains"
text = "echo: hello from {scratch}"
[[checks]]
type = "exit_code"
expected = 0
"#,
            ),
            write_case(
                temp.path(),
                "echo-repl",
                r#"turns = ["first", "second", "/exit"]
gateway_only = true
[[checks]]
type = "turn_contains"
turn = 2
text = "(previous: first)"
"#,
            ),
            write_case(
                temp.path(),
                "echo-mismatch",
                r#"prompt = "hi"
[[checks]]
type = "output_contains"
text = "never said"
"#,
            ),
        ];

        let template = resolve(Some("native"), temp.path()).expect("resolve");
        let gateway = CountingGateway::new(server.address());
        let counters = gateway.counters();
        let session = GatewaySession::open_with(template, Some(Box::new(gateway))).expect("open");

        let (root, results) = suite_paths(temp.path());
        let paths = SuitePaths {
            project_root: &root,
            results_dir: &results,
        };
        let report = run_suite(session, &HarnessConfig::default(), &cases, paths).expect("suite");

        assert_eq!(
            outcomes(&report),
            [
                ("echo-oneshot", Outcome::Pass),
                ("echo-repl", Outcome::Pass),
                ("echo-mismatch", Outcome::Fail),
            ]
        );
        assert!(report.has_failures());
        assert_eq!(counters.starts(), 1);
        assert_eq!(counters.effective_stops(), 1);
        assert_eq!(server.connections(), 3);

        let first = &report.cases[0].results_dir;
        assert!(first.starts_with(results.join("echo-oneshot")));
        assert!(first.join("transcript.json").exists());
        let meta = read_meta(&first.join("meta.json")).expect("meta");
        assert_eq!(meta.gateway_address.as_deref(), Some(server.address()));
    }

    #[test]
    fn direct_suite_skips_gateway_cases_and_continues_after_errors() {
        let temp = tempdir().expect("tempdir");
        let cases = vec![
            write_case(
                temp.path(),
                "no-agent",
                "prompt = \"hi\"\n[[checks]]\ntype = \"exit_code\"\nexpected = 0\n",
            ),
            write_case(
                temp.path(),
                "plan-explore",
                "turns = [\"/plan look\", \"/exit\"]\ngateway_only = true\n[[checks]]\ntype = \"exit_code\"\nexpected = 0\n",
            ),
        ];

        let template = resolve(Some("direct"), temp.path()).expect("resolve");
        let session = GatewaySession::open_with(template, None).expect("open");
        let (root, results) = suite_paths(temp.path());
        let paths = SuitePaths {
            project_root: &root,
            results_dir: &results,
        };
        let report = run_suite(session, &HarnessConfig::default(), &cases, paths).expect("suite");

        assert_eq!(
            outcomes(&report),
            [("no-agent", Outcome::Error), ("plan-explore", Outcome::Skipped)]
        );
        assert!(report.cases[0].error.is_some());
        assert_eq!(report.count(Outcome::Skipped), 1);

        let skipped = read_meta(&report.cases[1].results_dir.join("meta.json")).expect("meta");
        assert_eq!(skipped.outcome, Outcome::Skipped);
        assert!(!report.cases[1].results_dir.join("transcript.json").exists());
    }

    #[cfg(unix)]
    #[test]
    fn direct_suite_judges_files_written_by_the_agent() {
        use harness::test_support::write_fake_agent;

        let temp = tempdir().expect("tempdir");
        write_fake_agent(
            temp.path(),
            r#"echo "⏺ Write(file_path: \"fixtures/scratch/test.txt\")" >&2
printf 'validation test passed' > fixtures/scratch/test.txt
echo "Created the file for: $3""#,
        );
        let cases = vec![write_case(
            temp.path(),
            "write-file",
            r#"prompt = "Create {scratch}/test.txt"
timeout_secs = 30
[[checks]]
type = "exit_code"
expected = 0
[[checks]]
type = "file_equals"
path = "{scratch}/test.txt"
text = "validation test passed"
[[checks]]
type = "tool_called"
name = "Write"
"#,
        )];

        let template = resolve(Some("direct"), temp.path()).expect("resolve");
        let session = GatewaySession::open_with(template, None).expect("open");
        let (root, results) = suite_paths(temp.path());
        let paths = SuitePaths {
            project_root: &root,
            results_dir: &results,
        };
        let report = run_suite(session, &HarnessConfig::default(), &cases, paths).expect("suite");

        assert_eq!(outcomes(&report), [("write-file", Outcome::Pass)]);
        assert!(!report.has_failures());
        assert_eq!(
            fs::read_to_string(temp.path().join("fixtures/hello_repo/src/lib.rs")).expect("lib"),
            fixtures::HELLO_LIB_RS
        );
    }
}
