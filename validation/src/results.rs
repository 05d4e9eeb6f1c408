//! Result capture and persistence.
//!
//! Every case of a suite run gets `validation/results/<case_id>/<run_id>/`
//! with `meta.json`, `checks.json` and, when the runner returned, `transcript.json`.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use harness::mode::ExecutionMode;
use harness::result::RunnerResult;
use rand::{Rng, distributions::Alphanumeric};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};

use crate::judge::{Judgment, write_judgment};
use crate::outcome::Outcome;

/// Input for capturing the results of one case.
#[derive(Debug)]
pub struct CaptureInput<'a> {
    pub case_id: &'a str,
    pub case_path: &'a Path,
    pub run_id: &'a str,
    pub mode: ExecutionMode,
    pub gateway_address: Option<&'a str>,
    pub outcome: Outcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub result: Option<&'a RunnerResult>,
    /// Runner call failure, when `result` is absent.
    pub error: Option<String>,
    pub judgment: &'a Judgment,
    pub project_root: &'a Path,
}

/// Metadata for one case run, persisted to `meta.json`.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RunMeta {
    pub case_id: String,
    pub run_id: String,
    /// SHA-256 hash of the case file for reproducibility tracking.
    pub case_hash: String,
    /// Git SHA of the project under test at time of run.
    pub project_git_sha: Option<String>,
    pub mode: ExecutionMode,
    pub gateway_address: Option<String>,
    pub outcome: Outcome,
    pub start_time: String,
    pub end_time: String,
    pub duration_secs: f64,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    /// Non-fatal errors encountered during capture.
    pub capture_errors: Vec<String>,
}

/// Suite run id: UTC timestamp plus a short random suffix.
pub fn new_run_id() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(6)
        .collect::<String>()
        .to_lowercase();
    format!("run-{}-{suffix}", Utc::now().format("%Y%m%d_%H%M%S"))
}

/// Write meta, checks and transcript for one case.
#[instrument(skip_all, fields(case_id = %input.case_id, run_id = %input.run_id))]
pub fn capture_results(base_dir: &Path, input: &CaptureInput<'_>) -> Result<PathBuf> {
    let results_dir = results_dir(base_dir, input.case_id, input.run_id);
    fs::create_dir_all(&results_dir)
        .with_context(|| format!("create results dir {}", results_dir.display()))?;

    let mut capture_errors = Vec::new();

    let case_hash = match file_sha256(input.case_path) {
        Ok(hash) => hash,
        Err(err) => {
            capture_errors.push(format!("case hash: {err}"));
            String::new()
        }
    };

    let project_git_sha = match git_rev_parse(input.project_root) {
        Ok(sha) => Some(sha),
        Err(err) => {
            capture_errors.push(format!("project git sha: {err}"));
            None
        }
    };

    if let Some(result) = input.result {
        let contents = serde_json::to_string_pretty(result).context("serialize transcript")?;
        let path = results_dir.join("transcript.json");
        fs::write(&path, format!("{contents}\n"))
            .with_context(|| format!("write {}", path.display()))?;
    }
    write_judgment(&results_dir.join("checks.json"), input.judgment)?;

    if !capture_errors.is_empty() {
        debug!(errors = ?capture_errors, "capture had non-fatal errors");
    }

    let duration = input.finished_at - input.started_at;
    let meta = RunMeta {
        case_id: input.case_id.to_string(),
        run_id: input.run_id.to_string(),
        case_hash,
        project_git_sha,
        mode: input.mode,
        gateway_address: input.gateway_address.map(str::to_string),
        outcome: input.outcome,
        start_time: input.started_at.to_rfc3339(),
        end_time: input.finished_at.to_rfc3339(),
        duration_secs: duration.num_milliseconds() as f64 / 1000.0,
        exit_code: input.result.map(|result| result.exit_code),
        error: input.error.clone(),
        capture_errors,
    };

    write_meta(&results_dir.join("meta.json"), &meta)?;
    debug!(results_dir = %results_dir.display(), "results captured");
    Ok(results_dir)
}

pub fn results_dir(base_dir: &Path, case_id: &str, run_id: &str) -> PathBuf {
    base_dir.join(case_id).join(run_id)
}

pub fn read_meta(path: &Path) -> Result<RunMeta> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).context("parse meta")
}

fn write_meta(path: &Path, meta: &RunMeta) -> Result<()> {
    let contents = serde_json::to_string_pretty(meta).context("serialize meta")?;
    fs::write(path, format!("{contents}\n"))
        .with_context(|| format!("write meta {}", path.display()))?;
    Ok(())
}

fn file_sha256(path: &Path) -> Result<String> {
    let contents = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(contents);
    let digest = hasher.finalize();
    Ok(hex::encode(digest))
}

fn git_rev_parse(repo_root: &Path) -> Result<String> {
    let output = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(repo_root)
        .output()
        .context("git rev-parse")?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        warn!(stderr = %stderr.trim(), "git rev-parse failed");
        return Err(anyhow!("git rev-parse failed: {}", stderr.trim()));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
