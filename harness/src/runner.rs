//! Public invocation API: `oneshot` and `repl`.

use std::time::Duration;

use tracing::{info, instrument, warn};

use crate::config::HarnessConfig;
use crate::error::{HarnessError, Result};
use crate::mode::ModeConfig;
use crate::result::RunnerResult;
use crate::transport::{self, Deadline, Transport, Turn};

/// Sends prompts through the transport picked for the session's mode.
///
/// Cheap to build and stateless between calls; construct one per test.
pub struct Runner {
    transport: Box<dyn Transport>,
    timeout: Duration,
}

impl Runner {
    /// Runner for a resolved (and, for gateway modes, started) configuration.
    pub fn new(mode_config: &ModeConfig, config: &HarnessConfig) -> Result<Self> {
        Ok(Self::with_transport(
            transport::for_config(mode_config, config)?,
            config.call_timeout(),
        ))
    }

    pub fn with_transport(transport: Box<dyn Transport>, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Single prompt, single response.
    pub fn oneshot(&self, prompt: &str) -> Result<RunnerResult> {
        self.send(&[Turn::parse(prompt)])
    }

    /// Ordered turns against one agent session.
    ///
    /// Turns starting with `/` are control commands and are passed through
    /// verbatim. Without a trailing `/exit` the session is closed after the
    /// last turn.
    pub fn repl<I, S>(&self, turns: I) -> Result<RunnerResult>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let turns: Vec<Turn> = turns.into_iter().map(Turn::parse).collect();
        if turns.is_empty() {
            return Err(HarnessError::config("repl needs at least one turn"));
        }
        self.send(&turns)
    }

    #[instrument(skip_all, fields(turns = turns.len(), timeout_secs = self.timeout.as_secs()))]
    fn send(&self, turns: &[Turn]) -> Result<RunnerResult> {
        let deadline = Deadline::after(self.timeout);
        let result = self.transport.send(turns, deadline)?;
        // A transport that returns right at the deadline still counts as timed out.
        if deadline.expired() {
            warn!("transport finished after the deadline");
            return Err(deadline.timed_out());
        }
        info!(
            exit_code = result.exit_code,
            elapsed_ms = deadline.elapsed().as_millis() as u64,
            "runner call finished"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::thread;

    use super::*;
    use crate::result::TurnRecord;

    /// Records turns and answers each with its own text.
    struct Echo {
        seen: Arc<Mutex<Vec<Vec<Turn>>>>,
        delay: Duration,
    }

    impl Transport for Echo {
        fn send(&self, turns: &[Turn], _deadline: Deadline) -> Result<RunnerResult> {
            thread::sleep(self.delay);
            self.seen.lock().expect("lock").push(turns.to_vec());
            let transcript = turns
                .iter()
                .map(|turn| TurnRecord {
                    turn: turn.text.clone(),
                    response: format!("<{}>", turn.text),
                })
                .collect();
            Ok(RunnerResult::from_transcript(0, transcript))
        }
    }

    fn echo(delay: Duration) -> (Runner, Arc<Mutex<Vec<Vec<Turn>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let runner = Runner::with_transport(
            Box::new(Echo {
                seen: Arc::clone(&seen),
                delay,
            }),
            Duration::from_millis(200),
        );
        (runner, seen)
    }

    #[test]
    fn oneshot_sends_a_single_prompt() {
        let (runner, seen) = echo(Duration::ZERO);
        let result = runner.oneshot("hello").expect("oneshot");
        assert_eq!(result.output, "<hello>");
        assert_eq!(seen.lock().expect("lock")[0], vec![Turn::parse("hello")]);
    }

    #[test]
    fn repl_keeps_order_and_classifies_control_turns() {
        let (runner, seen) = echo(Duration::ZERO);
        let result = runner.repl(["first", "/mode plan", "second", "/exit"]).expect("repl");
        assert_eq!(result.output, "<first></mode plan><second></exit>");
        let sent = &seen.lock().expect("lock")[0];
        let control: Vec<bool> = sent.iter().map(|turn| turn.is_control).collect();
        assert_eq!(control, vec![false, true, false, true]);
    }

    #[test]
    fn empty_repl_is_rejected() {
        let (runner, _) = echo(Duration::ZERO);
        let err = runner.repl(Vec::<String>::new()).expect_err("empty");
        assert!(matches!(err, HarnessError::Config(_)));
    }

    #[test]
    fn late_result_is_a_timeout() {
        let (runner, _) = echo(Duration::from_millis(300));
        let err = runner.oneshot("slow").expect_err("late");
        assert!(matches!(err, HarnessError::RunnerTimeout { .. }));
    }
}
