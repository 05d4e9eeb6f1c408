//! Scenario case parsing and validation.
//!
//! Cases are TOML files describing what to send to the agent and what to
//! verify afterwards. See `validation/cases/` for examples.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use regex::Regex;
use serde::Deserialize;

/// A parsed case file: input, fixture needs, and checks.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct CaseFile {
    pub case: CaseMeta,
    #[serde(default)]
    pub fixtures: FixtureSpec,
    #[serde(default)]
    pub checks: Vec<Check>,
}

/// Case metadata and the turns sent to the agent.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct CaseMeta {
    /// Unique identifier (slug format: `[a-z0-9_-]+`).
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Single prompt sent with `oneshot`. Exclusive with `turns`.
    #[serde(default)]
    pub prompt: Option<String>,
    /// Ordered turns sent with `repl`. Exclusive with `prompt`.
    #[serde(default)]
    pub turns: Vec<String>,
    /// Only meaningful when a gateway is in front of the agent.
    #[serde(default)]
    pub gateway_only: bool,
    /// Per-call deadline override.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Fixture preparation requested by the case.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FixtureSpec {
    /// Reset `fixtures/scratch` before the case.
    pub scratch: bool,
    /// Template under `fixtures/` copied to `fixtures/<template>_scratch`.
    pub working_copy: Option<String>,
    /// Reset the agent's stored sessions.
    pub sessions: bool,
}

impl Default for FixtureSpec {
    fn default() -> Self {
        Self {
            scratch: true,
            working_copy: None,
            sessions: false,
        }
    }
}

/// What the runner is asked to do for this case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaseInput {
    Oneshot(String),
    Repl(Vec<String>),
}

impl CaseInput {
    pub fn turn_count(&self) -> usize {
        match self {
            CaseInput::Oneshot(_) => 1,
            CaseInput::Repl(turns) => turns.len(),
        }
    }
}

/// Verification run against the runner result and the project tree.
///
/// Paths are relative to the project root unless absolute, and may use
/// fixture placeholders such as `{scratch}`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Check {
    ExitCode { expected: i32 },
    OutputContains { text: String },
    OutputNotContains { text: String },
    /// Regular expression searched anywhere in the combined output.
    OutputMatches { pattern: String },
    /// Tool-call evidence such as `⏺ Read(...)` in the output.
    ToolCalled { name: String },
    /// Response to one turn (1-based) contains `text`.
    TurnContains { turn: usize, text: String },
    FileExists { path: String },
    FileContains { path: String, text: String },
    FileNotContains { path: String, text: String },
    /// File content equals `text`, ignoring trailing whitespace.
    FileEquals { path: String, text: String },
    /// Command exits zero when run from the project root.
    CommandSucceeds { cmd: Vec<String> },
}

impl CaseFile {
    /// Load and validate a case file from the given path.
    pub fn load(path: &Path) -> Result<Self> {
        let contents =
            fs::read_to_string(path).with_context(|| format!("read case {}", path.display()))?;
        Self::parse_str(&contents).with_context(|| format!("case {}", path.display()))
    }

    pub fn parse_str(contents: &str) -> Result<Self> {
        let case: CaseFile = toml::from_str(contents).context("parse case")?;
        case.validate()?;
        Ok(case)
    }

    pub fn input(&self) -> CaseInput {
        match &self.case.prompt {
            Some(prompt) => CaseInput::Oneshot(prompt.clone()),
            None => CaseInput::Repl(self.case.turns.clone()),
        }
    }

    fn validate(&self) -> Result<()> {
        validate_case_id(&self.case.id)?;
        match (&self.case.prompt, self.case.turns.is_empty()) {
            (Some(_), false) => bail!("case.prompt and case.turns are mutually exclusive"),
            (None, true) => bail!("case needs either prompt or turns"),
            (Some(prompt), true) if prompt.trim().is_empty() => {
                bail!("case.prompt must be non-empty")
            }
            _ => {}
        }
        if self.case.turns.iter().any(|turn| turn.trim().is_empty()) {
            bail!("case.turns must not contain empty turns");
        }
        if self.case.timeout_secs == Some(0) {
            bail!("case.timeout_secs must be > 0");
        }
        if let Some(template) = &self.fixtures.working_copy
            && (template.trim().is_empty() || template.contains(['/', '\\']) || template == "..")
        {
            bail!("fixtures.working_copy must be a directory name under fixtures/");
        }
        if self.checks.is_empty() {
            bail!("checks must be a non-empty array");
        }
        let turns = self.input().turn_count();
        for (index, check) in self.checks.iter().enumerate() {
            check
                .validate(turns)
                .with_context(|| format!("checks[{index}] invalid"))?;
        }
        Ok(())
    }
}

impl Check {
    fn validate(&self, turns: usize) -> Result<()> {
        match self {
            Check::ExitCode { .. } => {}
            Check::OutputContains { text } | Check::OutputNotContains { text } => {
                if text.is_empty() {
                    bail!("output check text must be non-empty");
                }
            }
            Check::OutputMatches { pattern } => {
                Regex::new(pattern).with_context(|| format!("output_matches.pattern {pattern:?}"))?;
            }
            Check::ToolCalled { name } => {
                if name.trim().is_empty() {
                    bail!("tool_called.name must be non-empty");
                }
            }
            Check::TurnContains { turn, .. } => {
                if *turn == 0 || *turn > turns {
                    bail!("turn_contains.turn must be between 1 and {turns}");
                }
            }
            Check::FileExists { path }
            | Check::FileContains { path, .. }
            | Check::FileNotContains { path, .. }
            | Check::FileEquals { path, .. } => {
                if path.trim().is_empty() {
                    bail!("file check path must be non-empty");
                }
            }
            Check::CommandSucceeds { cmd } => {
                if cmd.is_empty() || cmd[0].trim().is_empty() {
                    bail!("command_succeeds.cmd must be a non-empty array");
                }
            }
        }
        Ok(())
    }
}

/// A case together with the file it was loaded from.
#[derive(Debug, Clone)]
pub struct DiscoveredCase {
    pub path: PathBuf,
    pub file: CaseFile,
}

impl DiscoveredCase {
    pub fn id(&self) -> &str {
        &self.file.case.id
    }
}

/// Discover and load all case files from a directory.
///
/// Returns cases sorted by id. Errors if duplicate ids are found.
pub fn discover_cases(dir: &Path) -> Result<Vec<DiscoveredCase>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut cases = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read cases dir {}", dir.display()))? {
        let entry = entry.context("read case entry")?;
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("toml") {
            continue;
        }
        let file = CaseFile::load(&path)?;
        cases.push(DiscoveredCase { path, file });
    }
    cases.sort_by(|left, right| left.id().cmp(right.id()));
    for pair in cases.windows(2) {
        if pair[0].id() == pair[1].id() {
            return Err(anyhow!("duplicate case.id {}", pair[0].id()));
        }
    }
    Ok(cases)
}

/// Keep only the requested ids, in the requested order. Empty means all.
pub fn select_cases(cases: Vec<DiscoveredCase>, ids: &[String]) -> Result<Vec<DiscoveredCase>> {
    if ids.is_empty() {
        return Ok(cases);
    }
    ids.iter()
        .map(|id| {
            cases
                .iter()
                .find(|case| case.id() == id)
                .cloned()
                .ok_or_else(|| anyhow!("case {id} not found"))
        })
        .collect()
}

pub fn validate_case_id(id: &str) -> Result<()> {
    if id.trim().is_empty() {
        bail!("case.id must be non-empty");
    }
    if id.contains('/') || id.contains('\\') {
        bail!("case.id must not contain path separators");
    }
    if id.contains("..") {
        bail!("case.id must not contain '..'");
    }
    if !id
        .chars()
        .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-' || ch == '_')
    {
        bail!("case.id must use [a-z0-9_-] only");
    }
    Ok(())
}
