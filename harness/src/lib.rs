//! Execution-mode harness for driving the coding agent under test.
//!
//! The same scripted prompt can reach the agent three ways: by spawning the
//! release binary directly, through a gateway started from local processes,
//! or through a gateway started with docker compose. This crate hides that
//! choice behind a small API:
//!
//! - **[`mode`]**: resolves the mode selector into an immutable [`mode::ModeConfig`].
//! - **[`gateway`]**: starts the gateway once per session, waits until it
//!   accepts connections, and tears it down on every exit path.
//! - **[`transport`]**: the two request/response strategies (local process,
//!   gateway socket).
//! - **[`runner`]**: `oneshot` / `repl` on top of a transport, with a hard
//!   per-call deadline.
//! - **[`result`]**: the captured exit code, output, and per-turn transcript.

pub mod config;
pub mod error;
pub mod exit_codes;
pub mod gateway;
pub mod logging;
pub mod mode;
pub mod process;
pub mod result;
pub mod runner;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod transport;

pub use error::{HarnessError, Result};
