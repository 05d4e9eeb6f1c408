use serde::{Deserialize, Serialize};

use crate::judge::Judgment;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Pass,
    Fail,
    /// The runner call itself failed (timeout, protocol error, spawn failure).
    Error,
    /// Not applicable in the current execution mode.
    Skipped,
}

impl Outcome {
    pub fn is_failure(self) -> bool {
        matches!(self, Outcome::Fail | Outcome::Error)
    }
}

/// Outcome of a case whose runner call returned a result.
pub fn classify_outcome(judgment: &Judgment) -> Outcome {
    if judgment.all_passed() {
        Outcome::Pass
    } else {
        Outcome::Fail
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::judge::{CheckOutcome, Judgment};

    fn judgment(passes: &[bool]) -> Judgment {
        Judgment {
            checks: passes
                .iter()
                .map(|passed| CheckOutcome::ExitCode {
                    expected: 0,
                    actual: if *passed { 0 } else { 1 },
                    passed: *passed,
                })
                .collect(),
        }
    }

    #[test]
    fn pass_when_every_check_passes() {
        assert_eq!(classify_outcome(&judgment(&[true, true])), Outcome::Pass);
    }

    #[test]
    fn fail_when_any_check_fails() {
        assert_eq!(classify_outcome(&judgment(&[true, false])), Outcome::Fail);
    }

    #[test]
    fn failures_are_fail_and_error() {
        assert!(Outcome::Fail.is_failure());
        assert!(Outcome::Error.is_failure());
        assert!(!Outcome::Pass.is_failure());
        assert!(!Outcome::Skipped.is_failure());
    }
}
