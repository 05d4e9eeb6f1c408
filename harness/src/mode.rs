//! Execution-mode resolution.
//!
//! [`resolve`] is pure: it maps a selector string and a project root to a
//! [`ModeConfig`] without touching the filesystem or the network. For the
//! gateway modes the resolved address is a template; only a started
//! [`crate::gateway::GatewaySession`] substitutes the address it verified.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{HarnessError, Result};

/// Environment variable consulted when no `--mode` flag is given.
pub const MODE_ENV_VAR: &str = "BRAINPRO_TEST_MODE";

/// Well-known gateway endpoint shared by both gateway modes.
pub const DEFAULT_GATEWAY_ADDRESS: &str = "ws://localhost:18789/ws";

/// Agent binary name inside the release build output.
pub const AGENT_BINARY_NAME: &str = "yo";

/// Mode used when neither flag nor environment selects one.
pub const DEFAULT_MODE: ExecutionMode = ExecutionMode::Direct;

/// How the agent is reached for the lifetime of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Spawn the agent binary for every call.
    Direct,
    /// Gateway and agent daemon run as local processes.
    NativeGateway,
    /// Gateway and agent daemon run as a compose project.
    DockerGateway,
}

impl ExecutionMode {
    pub const ALL: [ExecutionMode; 3] = [
        ExecutionMode::Direct,
        ExecutionMode::NativeGateway,
        ExecutionMode::DockerGateway,
    ];

    /// Selector string accepted by [`resolve`].
    pub fn selector(self) -> &'static str {
        match self {
            ExecutionMode::Direct => "direct",
            ExecutionMode::NativeGateway => "native",
            ExecutionMode::DockerGateway => "docker",
        }
    }

    pub fn uses_gateway(self) -> bool {
        !matches!(self, ExecutionMode::Direct)
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.selector())
    }
}

impl FromStr for ExecutionMode {
    type Err = HarnessError;

    fn from_str(raw: &str) -> Result<Self> {
        let wanted = raw.trim();
        ExecutionMode::ALL
            .into_iter()
            .find(|mode| mode.selector().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| {
                HarnessError::config(format!(
                    "unrecognized execution mode {raw:?} (expected one of: direct, native, docker)"
                ))
            })
    }
}

/// Immutable description of how to reach the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModeConfig {
    mode: ExecutionMode,
    project_root: PathBuf,
    binary_path: PathBuf,
    gateway_address: Option<String>,
}

impl ModeConfig {
    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub fn binary_path(&self) -> &Path {
        &self.binary_path
    }

    /// Present iff the mode is gateway-backed.
    pub fn gateway_address(&self) -> Option<&str> {
        self.gateway_address.as_deref()
    }

    /// Copy of this config pointing at a concrete gateway address.
    ///
    /// Fails for direct mode, which never carries an address.
    pub fn with_gateway_address(&self, address: impl Into<String>) -> Result<Self> {
        if !self.mode.uses_gateway() {
            return Err(HarnessError::config(
                "direct mode does not use a gateway address",
            ));
        }
        Ok(Self {
            gateway_address: Some(address.into()),
            ..self.clone()
        })
    }
}

/// Path of the agent binary for a project root.
pub fn binary_path(project_root: &Path) -> PathBuf {
    let binary = format!("{AGENT_BINARY_NAME}{}", std::env::consts::EXE_SUFFIX);
    release_dir(project_root).join(binary)
}

/// Release build output directory (`<root>/target/release`).
pub fn release_dir(project_root: &Path) -> PathBuf {
    project_root.join("target").join("release")
}

/// Resolve a mode selector against a project root.
///
/// An absent selector falls back to [`DEFAULT_MODE`]. Unrecognized selectors
/// and relative project roots are configuration errors.
pub fn resolve(selector: Option<&str>, project_root: &Path) -> Result<ModeConfig> {
    let mode = match selector {
        Some(raw) => raw.parse()?,
        None => DEFAULT_MODE,
    };
    if !project_root.is_absolute() {
        return Err(HarnessError::config(format!(
            "project root must be absolute, got {}",
            project_root.display()
        )));
    }
    let gateway_address = mode
        .uses_gateway()
        .then(|| DEFAULT_GATEWAY_ADDRESS.to_string());
    Ok(ModeConfig {
        mode,
        project_root: project_root.to_path_buf(),
        binary_path: binary_path(project_root),
        gateway_address,
    })
}

/// Pick the selector: explicit flag first, then the environment value.
pub fn choose_selector(flag: Option<String>, env_value: Option<String>) -> Option<String> {
    flag.or(env_value)
}

/// [`choose_selector`] against the live [`MODE_ENV_VAR`].
pub fn selector_from_env(flag: Option<String>) -> Option<String> {
    choose_selector(flag, std::env::var(MODE_ENV_VAR).ok())
}
