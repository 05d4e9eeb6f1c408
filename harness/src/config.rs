//! Harness configuration stored under `validation/harness.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::gateway::probe::ProbePolicy;

/// Location of the config file relative to the project root.
pub const CONFIG_RELATIVE_PATH: &str = "validation/harness.toml";

/// Session-wide harness configuration (TOML).
///
/// Missing fields default to values that work against a local release build.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HarnessConfig {
    /// Hard deadline for a single `oneshot`/`repl` call, in seconds.
    pub call_timeout_secs: u64,

    /// Truncate captured agent stdout/stderr beyond this many bytes per stream.
    pub output_limit_bytes: usize,

    /// Extra flags passed to the agent binary in direct mode.
    pub agent_args: Vec<String>,

    /// Stderr line prefixes that mark the end of a turn in direct-mode REPL sessions.
    pub turn_markers: Vec<String>,

    pub gateway: GatewayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GatewayConfig {
    /// Total budget for the gateway to become reachable.
    pub startup_timeout_secs: u64,

    /// Budget for `docker compose down` and process reaping on stop.
    pub stop_timeout_secs: u64,

    pub probe_initial_delay_ms: u64,
    pub probe_max_delay_ms: u64,
    pub probe_connect_timeout_ms: u64,

    /// Replace the port of the well-known gateway address (one port per worker).
    pub port: Option<u16>,

    pub native: NativeGatewayConfig,
    pub docker: DockerGatewayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NativeGatewayConfig {
    /// Gateway binary name under `target/release/`.
    pub gateway_binary: String,
    /// Agent daemon binary name under `target/release/`.
    pub agent_binary: String,
    /// Unix socket shared by gateway and agent. Defaults to a private temp path.
    pub agent_socket: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DockerGatewayConfig {
    /// Compose invocation (e.g. `["docker","compose"]` or `["docker-compose"]`).
    pub command: Vec<String>,
    /// Compose file, relative to the project root. Compose's own lookup when unset.
    pub compose_file: Option<PathBuf>,
    pub project_name: String,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: 300,
            output_limit_bytes: 1_000_000,
            agent_args: vec!["--yes".to_string()],
            turn_markers: vec!["[Duration:".to_string(), "Error:".to_string()],
            gateway: GatewayConfig::default(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            startup_timeout_secs: 60,
            stop_timeout_secs: 10,
            probe_initial_delay_ms: 50,
            probe_max_delay_ms: 2_000,
            probe_connect_timeout_ms: 500,
            port: None,
            native: NativeGatewayConfig::default(),
            docker: DockerGatewayConfig::default(),
        }
    }
}

impl Default for NativeGatewayConfig {
    fn default() -> Self {
        Self {
            gateway_binary: "brainpro-gateway".to_string(),
            agent_binary: "brainpro-agent".to_string(),
            agent_socket: None,
        }
    }
}

impl Default for DockerGatewayConfig {
    fn default() -> Self {
        Self {
            command: vec!["docker".to_string(), "compose".to_string()],
            compose_file: None,
            project_name: "brainpro-validation".to_string(),
        }
    }
}

impl HarnessConfig {
    /// Config path for a project root.
    pub fn path(project_root: &Path) -> PathBuf {
        project_root.join(CONFIG_RELATIVE_PATH)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.call_timeout_secs == 0 {
            return Err(anyhow!("call_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.turn_markers.is_empty() || self.turn_markers.iter().any(|m| m.is_empty()) {
            return Err(anyhow!("turn_markers must be a non-empty array of non-empty strings"));
        }
        self.gateway.validate()
    }
}

impl GatewayConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn probe_policy(&self) -> ProbePolicy {
        ProbePolicy {
            initial_delay: Duration::from_millis(self.probe_initial_delay_ms),
            max_delay: Duration::from_millis(self.probe_max_delay_ms),
            connect_timeout: Duration::from_millis(self.probe_connect_timeout_ms),
            total: self.startup_timeout(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.startup_timeout_secs == 0 {
            return Err(anyhow!("gateway.startup_timeout_secs must be > 0"));
        }
        if self.stop_timeout_secs == 0 {
            return Err(anyhow!("gateway.stop_timeout_secs must be > 0"));
        }
        if self.probe_initial_delay_ms == 0 || self.probe_connect_timeout_ms == 0 {
            return Err(anyhow!(
                "gateway.probe_initial_delay_ms and probe_connect_timeout_ms must be > 0"
            ));
        }
        if self.probe_max_delay_ms < self.probe_initial_delay_ms {
            return Err(anyhow!(
                "gateway.probe_max_delay_ms must be >= probe_initial_delay_ms"
            ));
        }
        if self.port == Some(0) {
            return Err(anyhow!("gateway.port must be > 0"));
        }
        if self.native.gateway_binary.trim().is_empty()
            || self.native.agent_binary.trim().is_empty()
        {
            return Err(anyhow!("gateway.native binaries must be non-empty"));
        }
        if self.docker.command.is_empty() || self.docker.command[0].trim().is_empty() {
            return Err(anyhow!("gateway.docker.command must be a non-empty array"));
        }
        if self.docker.project_name.trim().is_empty() {
            return Err(anyhow!("gateway.docker.project_name must be non-empty"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `HarnessConfig::default()`.
pub fn load_config(path: &Path) -> Result<HarnessConfig> {
    if !path.exists() {
        let cfg = HarnessConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: HarnessConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}
