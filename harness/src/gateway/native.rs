//! Gateway started from local release binaries.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use anyhow::{Context, anyhow};
use tempfile::TempDir;
use tracing::{debug, info, instrument, warn};
use wait_timeout::ChildExt;

use super::probe::{self, ProbeFailure, ProbePolicy};
use super::{Gateway, GatewayState, Lifecycle};
use crate::config::{HarnessConfig, NativeGatewayConfig};
use crate::error::{HarnessError, Result};
use crate::mode::release_dir;
use crate::process::{kill_process_group, own_process_group};

/// Agent daemon plus gateway server, run as one local process group.
pub struct NativeGateway {
    project_root: PathBuf,
    address: String,
    settings: NativeGatewayConfig,
    probe: ProbePolicy,
    stop_timeout: Duration,
    diagnostics_limit: usize,
    lifecycle: Lifecycle,
    children: Vec<ManagedChild>,
    log_dir: Option<TempDir>,
}

struct ManagedChild {
    name: String,
    child: Child,
    log_path: PathBuf,
}

impl NativeGateway {
    pub fn new(project_root: &Path, address: impl Into<String>, config: &HarnessConfig) -> Self {
        Self {
            project_root: project_root.to_path_buf(),
            address: address.into(),
            settings: config.gateway.native.clone(),
            probe: config.gateway.probe_policy(),
            stop_timeout: config.gateway.stop_timeout(),
            diagnostics_limit: config.output_limit_bytes,
            lifecycle: Lifecycle::new(),
            children: Vec::new(),
            log_dir: None,
        }
    }

    /// Pids of the running processes, agent first.
    pub fn pids(&self) -> Vec<u32> {
        self.children.iter().map(|managed| managed.child.id()).collect()
    }

    fn spawn_all(&mut self) -> anyhow::Result<()> {
        let log_dir = tempfile::Builder::new()
            .prefix("harness-gateway-")
            .tempdir()
            .context("create gateway log dir")?;
        let socket = self
            .settings
            .agent_socket
            .clone()
            .unwrap_or_else(|| log_dir.path().join("agent.sock"));
        let port = probe::port_of(&self.address)?;
        let bin_dir = release_dir(&self.project_root);

        let mut agent = Command::new(bin_dir.join(&self.settings.agent_binary));
        agent.arg("--socket").arg(&socket);
        let agent = self.spawn_logged(agent, &self.settings.agent_binary.clone(), log_dir.path());

        self.log_dir = Some(log_dir);
        self.children.push(agent?);

        let mut gateway = Command::new(bin_dir.join(&self.settings.gateway_binary));
        gateway
            .arg("--port")
            .arg(port.to_string())
            .arg("--agent-socket")
            .arg(&socket);
        let log_dir = self
            .log_dir
            .as_ref()
            .map(|dir| dir.path().to_path_buf())
            .ok_or_else(|| anyhow!("gateway log dir missing"))?;
        let gateway = self.spawn_logged(gateway, &self.settings.gateway_binary.clone(), &log_dir)?;
        self.children.push(gateway);
        Ok(())
    }

    fn spawn_logged(
        &self,
        mut cmd: Command,
        name: &str,
        log_dir: &Path,
    ) -> anyhow::Result<ManagedChild> {
        let log_path = log_dir.join(format!("{name}.log"));
        let stdout = File::create(&log_path)
            .with_context(|| format!("create log {}", log_path.display()))?;
        let stderr = stdout
            .try_clone()
            .with_context(|| format!("clone log handle {}", log_path.display()))?;
        cmd.current_dir(&self.project_root)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        own_process_group(&mut cmd);
        let child = cmd.spawn().with_context(|| format!("spawn {name}"))?;
        debug!(name, pid = child.id(), "spawned gateway process");
        Ok(ManagedChild {
            name: name.to_string(),
            child,
            log_path,
        })
    }

    fn kill_all(&mut self) {
        // Gateway first so it stops accepting clients before the agent goes away.
        while let Some(mut managed) = self.children.pop() {
            // Descendants can outlive their leader, so the group is killed either way.
            if let Err(err) = kill_process_group(managed.child.id()) {
                warn!(name = %managed.name, err = %err, "kill process group");
                if let Err(err) = managed.child.kill() {
                    warn!(name = %managed.name, err = %err, "kill process");
                }
            }
            match managed.child.try_wait() {
                Ok(Some(status)) => {
                    debug!(name = %managed.name, ?status, "process already exited");
                    continue;
                }
                Ok(None) => {}
                Err(err) => warn!(name = %managed.name, err = %err, "poll process"),
            }
            match managed.child.wait_timeout(self.stop_timeout) {
                Ok(Some(_)) => debug!(name = %managed.name, "process reaped"),
                Ok(None) => warn!(name = %managed.name, "process did not exit after kill"),
                Err(err) => warn!(name = %managed.name, err = %err, "wait for process"),
            }
        }
    }

    fn diagnostics(&self) -> String {
        let Some(log_dir) = &self.log_dir else {
            return String::new();
        };
        let mut entries: Vec<PathBuf> = match fs::read_dir(log_dir.path()) {
            Ok(entries) => entries
                .filter_map(|entry| entry.ok().map(|entry| entry.path()))
                .filter(|path| path.extension().is_some_and(|ext| ext == "log"))
                .collect(),
            Err(err) => return format!("[could not read gateway logs: {err}]"),
        };
        entries.sort();
        let mut buf = String::new();
        for path in entries {
            let name = path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default();
            buf.push_str(&format!("=== {name} ===\n"));
            match fs::read(&path) {
                Ok(bytes) => buf.push_str(&tail(&bytes, self.diagnostics_limit)),
                Err(err) => buf.push_str(&format!("[unreadable: {err}]")),
            }
            buf.push('\n');
        }
        buf
    }

    fn check_alive(children: &mut [ManagedChild]) -> anyhow::Result<()> {
        for managed in children {
            if let Some(status) = managed
                .child
                .try_wait()
                .with_context(|| format!("poll {}", managed.name))?
            {
                return Err(anyhow!(
                    "{} exited during startup with {status} (log: {})",
                    managed.name,
                    managed.log_path.display()
                ));
            }
        }
        Ok(())
    }

    fn fail_start(&mut self, message: String) -> HarnessError {
        self.kill_all();
        let diagnostics = self.diagnostics();
        self.lifecycle.fail();
        self.log_dir = None;
        warn!(%message, "native gateway failed to start");
        HarnessError::GatewayStartup {
            message,
            diagnostics,
        }
    }
}

impl Gateway for NativeGateway {
    #[instrument(skip_all, fields(address = %self.address))]
    fn start(&mut self) -> Result<String> {
        if let Some(address) = self.lifecycle.begin_start()? {
            return Ok(address);
        }

        if let Err(err) = self.spawn_all() {
            return Err(self.fail_start(format!("{err:#}")));
        }

        let probe_result = {
            let children = &mut self.children;
            probe::wait_until_reachable(&self.address, &self.probe, || {
                Self::check_alive(children)
            })
        };
        match probe_result {
            Ok(elapsed) => {
                info!(elapsed_ms = elapsed.as_millis() as u64, "native gateway ready");
                self.lifecycle.ready(self.address.clone());
                Ok(self.address.clone())
            }
            Err(failure @ ProbeFailure::TimedOut { .. }) => Err(self.fail_start(format!(
                "{} {failure} within {:?}",
                self.address, self.probe.total
            ))),
            Err(failure @ ProbeFailure::Aborted(_)) => Err(self.fail_start(failure.to_string())),
        }
    }

    #[instrument(skip_all, fields(address = %self.address))]
    fn stop(&mut self) -> Result<()> {
        if !self.lifecycle.begin_stop() {
            return Ok(());
        }
        self.kill_all();
        self.log_dir = None;
        self.lifecycle.stopped();
        info!("native gateway stopped");
        Ok(())
    }

    fn state(&self) -> GatewayState {
        self.lifecycle.state()
    }
}

impl Drop for NativeGateway {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            warn!(err = %err, "native gateway teardown failed");
        }
        // Covers processes spawned by a start that never reached `Ready`.
        self.kill_all();
    }
}

/// Last `limit` bytes of `bytes`, lossily decoded.
fn tail(bytes: &[u8], limit: usize) -> String {
    let start = bytes.len().saturating_sub(limit);
    let mut text = String::new();
    if start > 0 {
        text.push_str(&format!("[... {start} earlier bytes omitted]\n"));
    }
    text.push_str(&String::from_utf8_lossy(&bytes[start..]));
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_keeps_last_bytes() {
        assert_eq!(tail(b"abcdef", 10), "abcdef");
        assert_eq!(tail(b"abcdef", 2), "[... 4 earlier bytes omitted]\nef");
    }

    #[test]
    fn stop_before_start_is_noop() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut gateway =
            NativeGateway::new(temp.path(), "ws://127.0.0.1:1/ws", &HarnessConfig::default());
        gateway.stop().expect("stop");
        gateway.stop().expect("stop again");
        assert_eq!(gateway.state(), GatewayState::Stopped);
    }

    #[test]
    fn missing_binaries_fail_with_startup_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut gateway =
            NativeGateway::new(temp.path(), "ws://127.0.0.1:1/ws", &HarnessConfig::default());
        let err = gateway.start().expect_err("no binaries");
        assert!(matches!(err, HarnessError::GatewayStartup { .. }));
        assert_eq!(gateway.state(), GatewayState::Failed);
        assert!(gateway.pids().is_empty());
        gateway.stop().expect("stop after failure is a no-op");
    }
}
