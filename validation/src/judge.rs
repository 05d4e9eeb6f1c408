//! Check execution and outcome recording.
//!
//! Runs verification checks against a runner result and the project tree and
//! records detailed outcomes, including command output.

use std::fs;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use harness::process::run_command_with_timeout;
use harness::result::RunnerResult;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::case::Check;
use crate::fixtures::FixturePaths;

/// Limits for command execution in checks.
#[derive(Debug, Clone, Copy)]
pub struct CommandLimits {
    /// Maximum time before killing the command.
    pub timeout: Duration,
    /// Maximum bytes to capture from stdout/stderr.
    pub output_limit_bytes: usize,
}

impl CommandLimits {
    /// Default limits: 120s timeout, 50KB output.
    pub fn default_limits() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            output_limit_bytes: 50_000,
        }
    }
}

/// Collected check outcomes for a case.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Judgment {
    pub checks: Vec<CheckOutcome>,
}

impl Judgment {
    pub fn all_passed(&self) -> bool {
        self.checks.iter().all(CheckOutcome::passed)
    }
}

/// Result of running a single check.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CheckOutcome {
    ExitCode {
        expected: i32,
        actual: i32,
        passed: bool,
    },
    OutputContains {
        text: String,
        passed: bool,
    },
    OutputNotContains {
        text: String,
        passed: bool,
    },
    OutputMatches {
        pattern: String,
        passed: bool,
    },
    ToolCalled {
        name: String,
        passed: bool,
    },
    TurnContains {
        turn: usize,
        text: String,
        passed: bool,
    },
    FileExists {
        path: String,
        passed: bool,
    },
    FileContains {
        path: String,
        text: String,
        passed: bool,
    },
    FileNotContains {
        path: String,
        text: String,
        passed: bool,
    },
    FileEquals {
        path: String,
        passed: bool,
        /// Content found, when it differs.
        actual: Option<String>,
    },
    CommandSucceeds {
        cmd: Vec<String>,
        passed: bool,
        exit_code: Option<i32>,
        timed_out: bool,
        stdout: String,
        stderr: String,
        stdout_truncated: bool,
        stderr_truncated: bool,
    },
}

impl CheckOutcome {
    pub fn passed(&self) -> bool {
        match self {
            CheckOutcome::ExitCode { passed, .. }
            | CheckOutcome::OutputContains { passed, .. }
            | CheckOutcome::OutputNotContains { passed, .. }
            | CheckOutcome::OutputMatches { passed, .. }
            | CheckOutcome::ToolCalled { passed, .. }
            | CheckOutcome::TurnContains { passed, .. }
            | CheckOutcome::FileExists { passed, .. }
            | CheckOutcome::FileContains { passed, .. }
            | CheckOutcome::FileNotContains { passed, .. }
            | CheckOutcome::FileEquals { passed, .. }
            | CheckOutcome::CommandSucceeds { passed, .. } => *passed,
        }
    }

    /// Stable label used to aggregate pass rates across runs.
    pub fn label(&self) -> String {
        match self {
            CheckOutcome::ExitCode { expected, .. } => format!("exit_code({expected})"),
            CheckOutcome::OutputContains { text, .. } => format!("output_contains({text})"),
            CheckOutcome::OutputNotContains { text, .. } => {
                format!("output_not_contains({text})")
            }
            CheckOutcome::OutputMatches { pattern, .. } => format!("output_matches({pattern})"),
            CheckOutcome::ToolCalled { name, .. } => format!("tool_called({name})"),
            CheckOutcome::TurnContains { turn, text, .. } => {
                format!("turn_contains({turn}, {text})")
            }
            CheckOutcome::FileExists { path, .. } => format!("file_exists({path})"),
            CheckOutcome::FileContains { path, text, .. } => {
                format!("file_contains({path}, {text})")
            }
            CheckOutcome::FileNotContains { path, text, .. } => {
                format!("file_not_contains({path}, {text})")
            }
            CheckOutcome::FileEquals { path, .. } => format!("file_equals({path})"),
            CheckOutcome::CommandSucceeds { cmd, .. } => {
                format!("command_succeeds({})", cmd.join(" "))
            }
        }
    }
}

/// Run all checks and collect outcomes.
///
/// Check paths are reported as written in the case, before substitution.
#[instrument(skip_all, fields(check_count = checks.len()))]
pub fn run_checks(
    checks: &[Check],
    result: &RunnerResult,
    paths: &FixturePaths,
    limits: CommandLimits,
) -> Result<Judgment> {
    let mut outcomes = Vec::with_capacity(checks.len());
    for check in checks {
        let outcome = run_check(check, result, paths, limits)?;
        if let CheckOutcome::CommandSucceeds {
            timed_out: true, ..
        } = &outcome
        {
            warn!(check = %outcome.label(), "check timed out");
        } else {
            debug!(check = %outcome.label(), passed = outcome.passed(), "check result");
        }
        outcomes.push(outcome);
    }
    Ok(Judgment { checks: outcomes })
}

fn run_check(
    check: &Check,
    result: &RunnerResult,
    paths: &FixturePaths,
    limits: CommandLimits,
) -> Result<CheckOutcome> {
    let outcome = match check {
        Check::ExitCode { expected } => CheckOutcome::ExitCode {
            expected: *expected,
            actual: result.exit_code,
            passed: result.exit_code == *expected,
        },
        Check::OutputContains { text } => CheckOutcome::OutputContains {
            text: text.clone(),
            passed: result.output.contains(paths.substitute(text)?.as_str()),
        },
        Check::OutputNotContains { text } => CheckOutcome::OutputNotContains {
            text: text.clone(),
            passed: !result.output.contains(paths.substitute(text)?.as_str()),
        },
        Check::OutputMatches { pattern } => {
            let regex = Regex::new(pattern).with_context(|| format!("compile {pattern:?}"))?;
            CheckOutcome::OutputMatches {
                pattern: pattern.clone(),
                passed: regex.is_match(&result.output),
            }
        }
        Check::ToolCalled { name } => CheckOutcome::ToolCalled {
            name: name.clone(),
            passed: tool_called(&result.output, name),
        },
        Check::TurnContains { turn, text } => {
            let expected = paths.substitute(text)?;
            CheckOutcome::TurnContains {
                turn: *turn,
                text: text.clone(),
                passed: turn
                    .checked_sub(1)
                    .and_then(|index| result.transcript.get(index))
                    .is_some_and(|record| record.response.contains(expected.as_str())),
            }
        }
        Check::FileExists { path } => CheckOutcome::FileExists {
            path: path.clone(),
            passed: paths.resolve(path)?.exists(),
        },
        Check::FileContains { path, text } => CheckOutcome::FileContains {
            path: path.clone(),
            text: text.clone(),
            passed: read_optional(&paths.resolve(path)?)?
                .is_some_and(|contents| contents.contains(text.as_str())),
        },
        Check::FileNotContains { path, text } => CheckOutcome::FileNotContains {
            path: path.clone(),
            text: text.clone(),
            passed: read_optional(&paths.resolve(path)?)?
                .is_some_and(|contents| !contents.contains(text.as_str())),
        },
        Check::FileEquals { path, text } => {
            let actual = read_optional(&paths.resolve(path)?)?;
            let passed = actual
                .as_deref()
                .is_some_and(|contents| contents.trim_end() == text.trim_end());
            CheckOutcome::FileEquals {
                path: path.clone(),
                passed,
                actual: if passed { None } else { actual },
            }
        }
        Check::CommandSucceeds { cmd } => {
            let cmd = cmd
                .iter()
                .map(|arg| paths.substitute(arg))
                .collect::<Result<Vec<_>>>()?;
            run_command_check(&cmd, &paths.project_root, limits)?
        }
    };
    Ok(outcome)
}

/// Tool calls are rendered as `⏺ Name(args)` by every transport.
fn tool_called(output: &str, name: &str) -> bool {
    output.contains(&format!("{name}("))
}

/// File contents, or `None` when the file does not exist.
fn read_optional(path: &Path) -> Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
}

fn run_command_check(
    cmd: &[String],
    project_root: &Path,
    limits: CommandLimits,
) -> Result<CheckOutcome> {
    if cmd.is_empty() {
        bail!("command_succeeds cmd must be non-empty");
    }

    let mut command = Command::new(&cmd[0]);
    command.args(&cmd[1..]).current_dir(project_root);
    let output = run_command_with_timeout(command, limits.timeout, limits.output_limit_bytes)
        .with_context(|| format!("run command {cmd:?}"))?;

    let exit_code = output.status.code();
    let passed = !output.timed_out && output.status.success();

    Ok(CheckOutcome::CommandSucceeds {
        cmd: cmd.to_vec(),
        passed,
        exit_code,
        timed_out: output.timed_out,
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        stdout_truncated: output.stdout_truncated > 0,
        stderr_truncated: output.stderr_truncated > 0,
    })
}

pub fn write_judgment(path: &Path, judgment: &Judgment) -> Result<()> {
    let contents = serde_json::to_string_pretty(judgment).context("serialize checks")?;
    fs::write(path, format!("{contents}\n"))
        .with_context(|| format!("write {}", path.display()))?;
    Ok(())
}
