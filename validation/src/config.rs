//! Harness configuration merging.
//!
//! Applies case-specific overrides to the session's harness configuration.

use std::time::Duration;

use anyhow::Result;
use harness::config::HarnessConfig;

use crate::case::CaseMeta;

/// Apply case overrides to the base harness config.
pub fn apply_case_config(base: &HarnessConfig, case: &CaseMeta) -> Result<HarnessConfig> {
    let mut merged = base.clone();
    if let Some(timeout_secs) = case.timeout_secs {
        merged.call_timeout_secs = timeout_secs;
    }
    merged.validate()?;
    Ok(merged)
}

/// Deadline for `command_succeeds` checks: never shorter than the call itself.
pub fn check_timeout(config: &HarnessConfig) -> Duration {
    config.call_timeout().max(Duration::from_secs(120))
}
