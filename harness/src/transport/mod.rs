//! Request/response strategies behind the runner.
//!
//! The strategy is picked once from the resolved [`ExecutionMode`]: direct mode
//! spawns the agent binary ([`LocalTransport`]), the gateway modes talk to the
//! running gateway over WebSocket ([`SocketTransport`]).

pub mod frames;
pub mod local;
pub mod socket;

use std::time::{Duration, Instant};

use crate::config::HarnessConfig;
use crate::error::{HarnessError, Result};
use crate::mode::{ExecutionMode, ModeConfig};
use crate::result::RunnerResult;

pub use local::LocalTransport;
pub use socket::SocketTransport;

/// Leading character of a control command (`/exit`, `/mode plan`, ...).
pub const CONTROL_SIGIL: char = '/';

/// Control commands that end the session.
pub const TERMINATE_COMMANDS: [&str; 2] = ["/exit", "/quit"];

/// One scripted turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub text: String,
    /// Passed through verbatim instead of being treated as a prompt.
    pub is_control: bool,
}

impl Turn {
    /// Classify raw turn text.
    pub fn parse(text: impl Into<String>) -> Self {
        let text = text.into();
        let is_control = text.trim_start().starts_with(CONTROL_SIGIL);
        Self { text, is_control }
    }

    pub fn is_terminate(&self) -> bool {
        self.is_control && TERMINATE_COMMANDS.contains(&self.text.trim())
    }
}

/// Hard deadline of one runner call.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    timeout: Duration,
}

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Self {
            started: Instant::now(),
            timeout,
        }
    }

    /// Time left, or `None` once the deadline has passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.timeout
            .checked_sub(self.started.elapsed())
            .filter(|left| !left.is_zero())
    }

    pub fn expired(&self) -> bool {
        self.remaining().is_none()
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn timed_out(&self) -> HarnessError {
        HarnessError::RunnerTimeout {
            timeout: self.timeout,
        }
    }
}

/// A way to deliver ordered turns to the agent.
///
/// Implementations must not send turn `k + 1` before the response to turn `k`
/// is complete, and must release their process or connection before
/// returning, including on error.
pub trait Transport: Send {
    fn send(&self, turns: &[Turn], deadline: Deadline) -> Result<RunnerResult>;
}

/// Transport for a resolved mode.
pub fn for_config(mode_config: &ModeConfig, config: &HarnessConfig) -> Result<Box<dyn Transport>> {
    match (mode_config.mode(), mode_config.gateway_address()) {
        (ExecutionMode::Direct, _) => Ok(Box::new(LocalTransport::new(mode_config, config))),
        (_, Some(address)) => Ok(Box::new(SocketTransport::new(address))),
        (mode, None) => Err(HarnessError::config(format!(
            "{mode} mode requires a gateway address"
        ))),
    }
}
