//! Gateway started as a compose project.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

use anyhow::{Context, anyhow};
use tracing::{debug, info, instrument, warn};

use super::probe::{self, ProbeFailure, ProbePolicy};
use super::{Gateway, GatewayState, Lifecycle};
use crate::config::{DockerGatewayConfig, HarnessConfig};
use crate::error::{HarnessError, Result};
use crate::process::{CommandOutput, run_command_with_timeout};

/// Gateway and agent daemon brought up with `compose up -d` and torn down with `compose down`.
pub struct DockerGateway {
    project_root: PathBuf,
    address: String,
    settings: DockerGatewayConfig,
    probe: ProbePolicy,
    stop_timeout: Duration,
    output_limit: usize,
    lifecycle: Lifecycle,
    /// `up` was issued, so `down` is owed even if startup failed later.
    project_up: bool,
}

impl DockerGateway {
    pub fn new(project_root: &Path, address: impl Into<String>, config: &HarnessConfig) -> Self {
        Self {
            project_root: project_root.to_path_buf(),
            address: address.into(),
            settings: config.gateway.docker.clone(),
            probe: config.gateway.probe_policy(),
            stop_timeout: config.gateway.stop_timeout(),
            output_limit: config.output_limit_bytes,
            lifecycle: Lifecycle::new(),
            project_up: false,
        }
    }

    fn compose(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.settings.command[0]);
        cmd.args(&self.settings.command[1..])
            .arg("-p")
            .arg(&self.settings.project_name);
        if let Some(file) = &self.settings.compose_file {
            cmd.arg("-f").arg(self.project_root.join(file));
        }
        cmd.args(args).current_dir(&self.project_root);
        cmd
    }

    fn run(&self, args: &[&str], timeout: Duration) -> anyhow::Result<CommandOutput> {
        let label = args.join(" ");
        debug!(args = %label, "running compose");
        let output = run_command_with_timeout(self.compose(args), timeout, self.output_limit)
            .with_context(|| format!("run compose {label}"))?;
        if output.timed_out {
            return Err(anyhow!("compose {label} timed out after {timeout:?}"));
        }
        if !output.status.success() {
            return Err(anyhow!(
                "compose {label} exited with {}: {}",
                output.exit_code(),
                output.combined_text().trim()
            ));
        }
        Ok(output)
    }

    fn up(&mut self) -> anyhow::Result<()> {
        self.project_up = true;
        self.run(&["up", "-d"], self.probe.total)?;
        Ok(())
    }

    fn down(&mut self) -> anyhow::Result<()> {
        if !self.project_up {
            return Ok(());
        }
        self.project_up = false;
        self.run(&["down"], self.stop_timeout)?;
        Ok(())
    }

    fn diagnostics(&self) -> String {
        match self.run(&["logs", "--no-color"], self.stop_timeout) {
            Ok(output) => output.combined_text(),
            Err(err) => format!("[could not collect compose logs: {err:#}]"),
        }
    }

    fn fail_start(&mut self, message: String) -> HarnessError {
        let diagnostics = if self.project_up {
            self.diagnostics()
        } else {
            String::new()
        };
        if let Err(err) = self.down() {
            warn!(err = %err, "compose down after failed start");
        }
        self.lifecycle.fail();
        warn!(%message, "docker gateway failed to start");
        HarnessError::GatewayStartup {
            message,
            diagnostics,
        }
    }
}

impl Gateway for DockerGateway {
    #[instrument(skip_all, fields(address = %self.address, project = %self.settings.project_name))]
    fn start(&mut self) -> Result<String> {
        if let Some(address) = self.lifecycle.begin_start()? {
            return Ok(address);
        }
        let started = Instant::now();

        if let Err(err) = self.up() {
            return Err(self.fail_start(format!("{err:#}")));
        }

        // `up -d` already spent part of the startup budget.
        let policy = ProbePolicy {
            total: self.probe.total.saturating_sub(started.elapsed()),
            ..self.probe
        };
        match probe::wait_until_reachable(&self.address, &policy, || Ok(())) {
            Ok(_) => {
                info!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "docker gateway ready"
                );
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

    #[instrument(skip_all, fields(project = %self.settings.project_name))]
    fn stop(&mut self) -> Result<()> {
        if !self.lifecycle.begin_stop() {
            return Ok(());
        }
        let result = self.down();
        self.lifecycle.stopped();
        match result {
            Ok(()) => {
                info!("docker gateway stopped");
                Ok(())
            }
            Err(err) => Err(HarnessError::Other(err.context("stop docker gateway"))),
        }
    }

    fn state(&self) -> GatewayState {
        self.lifecycle.state()
    }
}

impl Drop for DockerGateway {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            warn!(err = %err, "docker gateway teardown failed");
        }
    }
}
