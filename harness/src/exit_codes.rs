//! Stable exit codes for the `harness` and `validate` binaries.

/// Call succeeded and the agent exited cleanly.
pub const OK: i32 = 0;
/// The agent (or a scenario) reported failure, or an unclassified error occurred.
pub const AGENT_FAILED: i32 = 1;
/// Unrecognized mode selector or invalid configuration.
pub const CONFIG: i32 = 2;
/// The gateway never became reachable.
pub const GATEWAY: i32 = 3;
/// A runner call exceeded its deadline.
pub const TIMEOUT: i32 = 4;
/// The gateway sent an unexpected or malformed frame.
pub const PROTOCOL: i32 = 5;
