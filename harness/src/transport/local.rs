//! Direct invocation of the agent binary.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use super::{Deadline, Transport, Turn};
use crate::config::HarnessConfig;
use crate::error::{HarnessError, Result};
use crate::mode::ModeConfig;
use crate::process::{InteractiveChild, LineEvent, StreamKind, run_command_with_timeout};
use crate::result::{RunnerResult, TurnRecord};

/// Quiet period after which a non-terminating control command is considered answered.
const CONTROL_SETTLE: Duration = Duration::from_millis(200);

/// Spawns the agent binary: once per single-prompt call, or as one
/// interactive session fed over stdin for multi-turn calls.
pub struct LocalTransport {
    binary: PathBuf,
    project_root: PathBuf,
    agent_args: Vec<String>,
    turn_markers: Vec<String>,
    output_limit: usize,
}

/// How a turn's output ended.
enum TurnEnd {
    /// A turn marker was seen; the agent is waiting for the next line.
    Marker,
    /// The agent closed its output, i.e. exited.
    Exited,
}

impl LocalTransport {
    pub fn new(mode_config: &ModeConfig, config: &HarnessConfig) -> Self {
        Self {
            binary: mode_config.binary_path().to_path_buf(),
            project_root: mode_config.project_root().to_path_buf(),
            agent_args: config.agent_args.clone(),
            turn_markers: config.turn_markers.clone(),
            output_limit: config.output_limit_bytes,
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(&self.agent_args).current_dir(&self.project_root);
        cmd
    }

    #[instrument(skip_all)]
    fn single(&self, turn: &Turn, deadline: Deadline) -> Result<RunnerResult> {
        let remaining = deadline.remaining().ok_or_else(|| deadline.timed_out())?;
        let mut cmd = self.command();
        cmd.arg("-p").arg(&turn.text);
        let output = run_command_with_timeout(cmd, remaining, self.output_limit)?;
        if output.timed_out {
            return Err(deadline.timed_out());
        }
        debug!(exit_code = output.exit_code(), "agent finished");
        Ok(RunnerResult::from_transcript(
            output.exit_code(),
            vec![TurnRecord {
                turn: turn.text.clone(),
                response: output.combined_text(),
            }],
        ))
    }

    #[instrument(skip_all, fields(turns = turns.len()))]
    fn session(&self, turns: &[Turn], deadline: Deadline) -> Result<RunnerResult> {
        // The agent reads one turn per stdin line.
        if let Some(turn) = turns.iter().find(|turn| turn.text.contains(['\n', '\r'])) {
            return Err(HarnessError::InvalidTurn {
                turn: turn.text.clone(),
                reason: "interactive turns must be a single line".to_string(),
            });
        }
        let mut child = InteractiveChild::spawn(self.command())?;
        let mut transcript = Vec::with_capacity(turns.len());
        let mut stdin_open = true;

        for (index, turn) in turns.iter().enumerate() {
            if turn.is_terminate() {
                if let Err(err) = child.write_line(&turn.text) {
                    debug!(err = %err, "agent already stopped reading input");
                }
                child.close_stdin();
                stdin_open = false;
                let response = read_until_closed(&mut child, deadline)?;
                transcript.push(record(turn, response));
                break;
            }

            if let Err(err) = child.write_line(&turn.text) {
                debug!(err = %err, turn = index, "agent stopped reading input");
                stdin_open = false;
                let response = read_until_closed(&mut child, deadline)?;
                transcript.push(record(turn, response));
                break;
            }

            if turn.is_control {
                let response = read_settled(&mut child, deadline)?;
                transcript.push(record(turn, response));
                continue;
            }

            let (response, end) = self.read_turn(&mut child, deadline)?;
            transcript.push(record(turn, response));
            if let TurnEnd::Exited = end {
                stdin_open = false;
                if index + 1 < turns.len() {
                    warn!(
                        unsent = turns.len() - index - 1,
                        "agent exited before all turns were sent"
                    );
                }
                break;
            }
        }

        if stdin_open {
            child.close_stdin();
            let trailing = read_until_closed(&mut child, deadline)?;
            if let Some(last) = transcript.last_mut() {
                last.response.push_str(&trailing);
            }
        }

        let status = match deadline.remaining() {
            Some(wait) => child.wait_exit(wait)?,
            None => None,
        };
        let Some(status) = status else {
            kill(&mut child);
            return Err(deadline.timed_out());
        };
        let exit_code = status.code().unwrap_or(-1);
        debug!(exit_code, "agent session finished");
        Ok(RunnerResult::from_transcript(exit_code, transcript))
    }

    /// Output of one natural-language turn, up to and including the marker line.
    fn read_turn(
        &self,
        child: &mut InteractiveChild,
        deadline: Deadline,
    ) -> Result<(String, TurnEnd)> {
        let mut response = String::new();
        loop {
            let Some(wait) = deadline.remaining() else {
                kill(child);
                return Err(deadline.timed_out());
            };
            match child.next_line(wait) {
                LineEvent::Line(line) => {
                    response.push_str(&line.text);
                    if line.stream == StreamKind::Stderr && self.is_marker(&line.text) {
                        return Ok((response, TurnEnd::Marker));
                    }
                }
                LineEvent::Idle => {}
                LineEvent::Closed => return Ok((response, TurnEnd::Exited)),
            }
        }
    }

    fn is_marker(&self, line: &str) -> bool {
        self.turn_markers
            .iter()
            .any(|marker| line.starts_with(marker.as_str()))
    }
}

impl Transport for LocalTransport {
    fn send(&self, turns: &[Turn], deadline: Deadline) -> Result<RunnerResult> {
        match turns {
            [turn] if !turn.is_control => self.single(turn, deadline),
            _ => self.session(turns, deadline),
        }
    }
}

fn record(turn: &Turn, response: String) -> TurnRecord {
    TurnRecord {
        turn: turn.text.clone(),
        response,
    }
}

/// Everything the agent prints until both pipes close.
fn read_until_closed(child: &mut InteractiveChild, deadline: Deadline) -> Result<String> {
    let mut response = String::new();
    loop {
        let Some(wait) = deadline.remaining() else {
            kill(child);
            return Err(deadline.timed_out());
        };
        match child.next_line(wait) {
            LineEvent::Line(line) => response.push_str(&line.text),
            LineEvent::Idle => {}
            LineEvent::Closed => return Ok(response),
        }
    }
}

/// Output already produced plus whatever follows until the agent goes quiet.
fn read_settled(child: &mut InteractiveChild, deadline: Deadline) -> Result<String> {
    let mut response: String = child
        .drain_available()
        .into_iter()
        .map(|line| line.text)
        .collect();
    loop {
        let Some(left) = deadline.remaining() else {
            kill(child);
            return Err(deadline.timed_out());
        };
        match child.next_line(CONTROL_SETTLE.min(left)) {
            LineEvent::Line(line) => response.push_str(&line.text),
            LineEvent::Idle | LineEvent::Closed => return Ok(response),
        }
    }
}

fn kill(child: &mut InteractiveChild) {
    let pid = child.id();
    match child.kill() {
        Ok(status) => warn!(pid, ?status, "killed agent after deadline"),
        Err(err) => warn!(pid, err = %err, "failed to kill agent"),
    }
}
