//! Gateway lifecycle management.
//!
//! A [`Gateway`] starts the network control channel for the gateway-backed
//! modes and tears it down again. [`GatewaySession`] owns the one gateway of a
//! test session: it starts it on open, publishes the verified address through
//! its [`ModeConfig`], and stops it on drop so teardown runs on every exit path.

pub mod docker;
pub mod native;
pub mod probe;

use tracing::{info, instrument, warn};

use crate::config::HarnessConfig;
use crate::error::{HarnessError, Result};
use crate::mode::{ExecutionMode, ModeConfig};
use crate::runner::Runner;

pub use docker::DockerGateway;
pub use native::NativeGateway;

/// Lifecycle state of a gateway.
///
/// `Stopped → Starting → Ready → Stopping → Stopped`, or `Starting → Failed`.
/// `Failed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayState {
    Stopped,
    Starting,
    Ready,
    Stopping,
    Failed,
}

/// Start/stop contract shared by the local-process and compose gateways.
pub trait Gateway: Send {
    /// Start the gateway and block until it accepts connections.
    ///
    /// Returns the verified address. Calling it again while `Ready` returns the
    /// same address without starting anything.
    fn start(&mut self) -> Result<String>;

    /// Stop the gateway. Only the first call after a successful start has an effect.
    fn stop(&mut self) -> Result<()>;

    fn state(&self) -> GatewayState;
}

/// State machine shared by gateway implementations.
#[derive(Debug)]
pub(crate) struct Lifecycle {
    state: GatewayState,
    address: Option<String>,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self {
            state: GatewayState::Stopped,
            address: None,
        }
    }

    pub(crate) fn state(&self) -> GatewayState {
        self.state
    }

    /// Enter `Starting`. `Ok(Some(address))` when already ready.
    pub(crate) fn begin_start(&mut self) -> Result<Option<String>> {
        match self.state {
            GatewayState::Stopped => {
                self.state = GatewayState::Starting;
                Ok(None)
            }
            GatewayState::Ready => Ok(self.address.clone()),
            GatewayState::Failed => Err(HarnessError::GatewayStartup {
                message: "gateway already failed to start in this session".to_string(),
                diagnostics: String::new(),
            }),
            GatewayState::Starting | GatewayState::Stopping => Err(HarnessError::config(format!(
                "gateway cannot start while {:?}",
                self.state
            ))),
        }
    }

    pub(crate) fn ready(&mut self, address: String) {
        self.state = GatewayState::Ready;
        self.address = Some(address);
    }

    pub(crate) fn fail(&mut self) {
        self.state = GatewayState::Failed;
        self.address = None;
    }

    /// Enter `Stopping`. False when there is nothing to stop.
    pub(crate) fn begin_stop(&mut self) -> bool {
        if self.state != GatewayState::Ready {
            return false;
        }
        self.state = GatewayState::Stopping;
        true
    }

    pub(crate) fn stopped(&mut self) {
        self.state = GatewayState::Stopped;
        self.address = None;
    }
}

/// Address the gateway should bind: the template with `gateway.port` applied.
pub fn expected_address(
    mode_config: &ModeConfig,
    config: &HarnessConfig,
) -> Result<Option<String>> {
    let Some(template) = mode_config.gateway_address() else {
        return Ok(None);
    };
    let address = match config.gateway.port {
        Some(port) => probe::with_port(template, port)?,
        None => template.to_string(),
    };
    Ok(Some(address))
}

/// Build the gateway for a resolved mode. `None` for direct mode.
pub fn for_config(
    mode_config: &ModeConfig,
    config: &HarnessConfig,
) -> Result<Option<Box<dyn Gateway>>> {
    let Some(address) = expected_address(mode_config, config)? else {
        return Ok(None);
    };
    let gateway: Box<dyn Gateway> = match mode_config.mode() {
        ExecutionMode::Direct => return Ok(None),
        ExecutionMode::NativeGateway => Box::new(NativeGateway::new(
            mode_config.project_root(),
            address,
            config,
        )),
        ExecutionMode::DockerGateway => Box::new(DockerGateway::new(
            mode_config.project_root(),
            address,
            config,
        )),
    };
    Ok(Some(gateway))
}

/// The gateway of one test session, stopped when dropped.
pub struct GatewaySession {
    mode_config: ModeConfig,
    gateway: Option<Box<dyn Gateway>>,
}

impl GatewaySession {
    /// Start the gateway selected by `template` (if any).
    pub fn open(template: ModeConfig, config: &HarnessConfig) -> Result<Self> {
        let gateway = for_config(&template, config)?;
        Self::open_with(template, gateway)
    }

    /// Start an explicitly provided gateway.
    ///
    /// On failure the gateway is dropped, which stops anything it spawned.
    #[instrument(skip_all, fields(mode = %template.mode()))]
    pub fn open_with(template: ModeConfig, gateway: Option<Box<dyn Gateway>>) -> Result<Self> {
        let Some(mut gateway) = gateway else {
            return Ok(Self {
                mode_config: template,
                gateway: None,
            });
        };
        let address = gateway.start()?;
        let mode_config = template.with_gateway_address(address)?;
        info!(address = ?mode_config.gateway_address(), "gateway session open");
        Ok(Self {
            mode_config,
            gateway: Some(gateway),
        })
    }

    /// Config with the verified gateway address substituted.
    pub fn mode_config(&self) -> &ModeConfig {
        &self.mode_config
    }

    pub fn state(&self) -> Option<GatewayState> {
        self.gateway.as_ref().map(|gateway| gateway.state())
    }

    /// A fresh runner bound to this session.
    pub fn runner(&self, config: &HarnessConfig) -> Result<Runner> {
        Runner::new(&self.mode_config, config)
    }

    /// Stop the gateway now and surface teardown errors.
    pub fn close(mut self) -> Result<()> {
        match self.gateway.as_mut() {
            Some(gateway) => gateway.stop(),
            None => Ok(()),
        }
    }
}

impl Drop for GatewaySession {
    fn drop(&mut self) {
        if let Some(gateway) = self.gateway.as_mut()
            && let Err(err) = gateway.stop()
        {
            warn!(err = %err, "gateway teardown failed");
        }
    }
}
