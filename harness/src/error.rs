//! Error taxonomy shared by every harness layer.

use std::time::Duration;

use thiserror::Error;

use crate::exit_codes;

/// Failures surfaced by mode resolution, the gateway lifecycle, and runner calls.
///
/// `Config` and `GatewayStartup` abort the whole session. `InvalidTurn`,
/// `RunnerTimeout` and `RunnerProtocol` are scoped to the single call that
/// produced them.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("config error: {0}")]
    Config(String),

    #[error("gateway failed to start: {message}\n--- diagnostics ---\n{diagnostics}")]
    GatewayStartup {
        message: String,
        /// Captured stdout/stderr of the gateway processes or containers.
        diagnostics: String,
    },

    #[error("invalid turn {turn:?}: {reason}")]
    InvalidTurn { turn: String, reason: String },

    #[error("runner call timed out after {timeout:?}")]
    RunnerTimeout { timeout: Duration },

    #[error("gateway protocol error: {message} (payload: {payload})")]
    RunnerProtocol {
        message: String,
        /// Raw frame that could not be handled.
        payload: String,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T, E = HarnessError> = std::result::Result<T, E>;

impl HarnessError {
    pub fn config(message: impl Into<String>) -> Self {
        HarnessError::Config(message.into())
    }

    pub fn protocol(message: impl Into<String>, payload: impl Into<String>) -> Self {
        HarnessError::RunnerProtocol {
            message: message.into(),
            payload: payload.into(),
        }
    }

    /// True when no further call in the session can succeed.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            HarnessError::Config(_) | HarnessError::GatewayStartup { .. }
        )
    }

    /// Stable process exit code for CLI reporting.
    pub fn exit_code(&self) -> i32 {
        match self {
            HarnessError::Config(_) | HarnessError::InvalidTurn { .. } => exit_codes::CONFIG,
            HarnessError::GatewayStartup { .. } => exit_codes::GATEWAY,
            HarnessError::RunnerTimeout { .. } => exit_codes::TIMEOUT,
            HarnessError::RunnerProtocol { .. } => exit_codes::PROTOCOL,
            HarnessError::Other(_) => exit_codes::AGENT_FAILED,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_fatal_only_for_setup_failures() {
        assert!(HarnessError::config("bad mode").is_session_fatal());
        assert!(
            HarnessError::GatewayStartup {
                message: "timeout".to_string(),
                diagnostics: String::new(),
            }
            .is_session_fatal()
        );
        assert!(
            !HarnessError::RunnerTimeout {
                timeout: Duration::from_secs(1)
            }
            .is_session_fatal()
        );
        assert!(!HarnessError::protocol("bad frame", "{").is_session_fatal());
        let invalid = HarnessError::InvalidTurn {
            turn: "a\nb".to_string(),
            reason: "spans lines".to_string(),
        };
        assert!(!invalid.is_session_fatal());
        assert_eq!(invalid.exit_code(), exit_codes::CONFIG);
    }

    #[test]
    fn gateway_error_display_includes_diagnostics() {
        let err = HarnessError::GatewayStartup {
            message: "not reachable".to_string(),
            diagnostics: "bind: address in use".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("not reachable"));
        assert!(text.contains("address in use"));
    }
}
