//! Normalized outcome of a runner call.

use serde::{Deserialize, Serialize};

/// One turn and the agent's visible response to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnRecord {
    pub turn: String,
    pub response: String,
}

/// Captured result of a `oneshot` or `repl` call.
///
/// `output` is the concatenation of every transcript response, in order.
/// Matching against it is left to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerResult {
    pub exit_code: i32,
    pub output: String,
    pub transcript: Vec<TurnRecord>,
}

impl RunnerResult {
    pub(crate) fn from_transcript(exit_code: i32, transcript: Vec<TurnRecord>) -> Self {
        let output = transcript
            .iter()
            .map(|record| record.response.as_str())
            .collect();
        Self {
            exit_code,
            output,
            transcript,
        }
    }
}
