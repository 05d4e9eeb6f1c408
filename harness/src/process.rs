//! Helpers for running child processes with timeouts and bounded output.

use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// How long pipe readers may lag behind the deadline, or behind a process group kill.
const READER_GRACE: Duration = Duration::from_secs(2);

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    /// Stdout followed by stderr, lossily decoded.
    pub fn combined_text(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&self.stderr));
        text
    }

    /// Exit code, or -1 when the child was terminated by a signal.
    pub fn exit_code(&self) -> i32 {
        self.status.code().unwrap_or(-1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    own_process_group(&mut cmd);

    let started = Instant::now();
    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let (tx, rx) = mpsc::channel();
    spawn_limited_reader(StreamKind::Stdout, stdout, output_limit_bytes, tx.clone());
    spawn_limited_reader(StreamKind::Stderr, stderr, output_limit_bytes, tx);

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            kill_tree(&mut child)?;
            child.wait().context("wait command after kill")?
        }
    };

    // Background descendants can hold the pipes open after the child exits.
    let mut readers_until = if timed_out {
        Instant::now() + READER_GRACE
    } else {
        started + timeout + READER_GRACE
    };
    let mut captured = CapturedStreams::default();
    let mut pending = 2;
    while pending > 0 {
        let wait = readers_until.saturating_duration_since(Instant::now());
        match rx.recv_timeout(wait) {
            Ok(message) => {
                captured.accept(message)?;
                pending -= 1;
            }
            Err(RecvTimeoutError::Disconnected) => bail!("output reader thread panicked"),
            Err(RecvTimeoutError::Timeout) if timed_out => {
                warn!("output readers still blocked after kill, abandoning them");
                break;
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    timeout_secs = timeout.as_secs(),
                    "output still open past the deadline, killing process group"
                );
                timed_out = true;
                kill_process_group(child.id())?;
                readers_until = Instant::now() + READER_GRACE;
            }
        }
    }

    if captured.stdout_truncated > 0 || captured.stderr_truncated > 0 {
        warn!(
            stdout_truncated = captured.stdout_truncated,
            stderr_truncated = captured.stderr_truncated,
            "output truncated"
        );
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout: captured.stdout,
        stderr: captured.stderr,
        stdout_truncated: captured.stdout_truncated,
        stderr_truncated: captured.stderr_truncated,
        timed_out,
    })
}

/// Put the child in a new process group led by itself, so its descendants can be killed with it.
pub fn own_process_group(cmd: &mut Command) {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    #[cfg(not(unix))]
    let _ = cmd;
}

/// SIGKILL every process in the group led by `pid`. A group that is already gone is not an error.
#[cfg(unix)]
pub fn kill_process_group(pid: u32) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let pgid = i32::try_from(pid).with_context(|| format!("pid {pid} out of range"))?;
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(err) => Err(err).with_context(|| format!("kill process group {pgid}")),
    }
}

#[cfg(not(unix))]
pub fn kill_process_group(_pid: u32) -> Result<()> {
    Ok(())
}

/// Kill a child spawned with [`own_process_group`] together with its descendants.
pub fn kill_tree(child: &mut Child) -> Result<()> {
    if cfg!(unix) {
        kill_process_group(child.id())
    } else {
        child.kill().context("kill command")
    }
}

type ReaderMessage = (StreamKind, Result<(Vec<u8>, usize)>);

#[derive(Default)]
struct CapturedStreams {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    stdout_truncated: usize,
    stderr_truncated: usize,
}

impl CapturedStreams {
    fn accept(&mut self, (kind, result): ReaderMessage) -> Result<()> {
        let (buf, truncated) = match kind {
            StreamKind::Stdout => result.context("read stdout")?,
            StreamKind::Stderr => result.context("read stderr")?,
        };
        match kind {
            StreamKind::Stdout => {
                self.stdout = buf;
                self.stdout_truncated = truncated;
            }
            StreamKind::Stderr => {
                self.stderr = buf;
                self.stderr_truncated = truncated;
            }
        }
        Ok(())
    }
}

fn spawn_limited_reader<R: Read + Send + 'static>(
    kind: StreamKind,
    reader: R,
    limit: usize,
    tx: Sender<ReaderMessage>,
) {
    thread::spawn(move || {
        let result = read_stream_limited(reader, limit);
        let _ = tx.send((kind, result));
    });
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}

/// One line of child output, tagged with the stream it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: StreamKind,
    /// Line text including its trailing newline, if any.
    pub text: String,
}

/// Result of waiting for the next output line.
#[derive(Debug)]
pub enum LineEvent {
    Line(OutputLine),
    /// Nothing arrived before the wait elapsed.
    Idle,
    /// Both pipes reached end of file.
    Closed,
}

/// A long-lived child fed line by line over stdin while its output is read concurrently.
///
/// The child is killed on drop if it is still running, so an early return on
/// any error path never leaves it behind.
pub struct InteractiveChild {
    child: Child,
    stdin: Option<ChildStdin>,
    lines: Receiver<OutputLine>,
}

impl InteractiveChild {
    #[instrument(skip_all)]
    pub fn spawn(mut cmd: Command) -> Result<Self> {
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        own_process_group(&mut cmd);

        debug!("spawning interactive child");
        let mut child = cmd.spawn().context("spawn interactive command")?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("stdout was not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("stderr was not piped"))?;

        let (tx, rx) = mpsc::channel();
        spawn_line_reader(StreamKind::Stdout, stdout, tx.clone());
        spawn_line_reader(StreamKind::Stderr, stderr, tx);

        Ok(Self {
            child,
            stdin: Some(stdin),
            lines: rx,
        })
    }

    /// Write one line to the child's stdin and flush it.
    pub fn write_line(&mut self, line: &str) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| anyhow!("stdin already closed"))?;
        stdin
            .write_all(line.as_bytes())
            .and_then(|()| stdin.write_all(b"\n"))
            .and_then(|()| stdin.flush())
            .context("write child stdin")
    }

    /// Close stdin so the child sees end of file.
    pub fn close_stdin(&mut self) {
        self.stdin.take();
    }

    pub fn next_line(&self, wait: Duration) -> LineEvent {
        match self.lines.recv_timeout(wait) {
            Ok(line) => LineEvent::Line(line),
            Err(RecvTimeoutError::Timeout) => LineEvent::Idle,
            Err(RecvTimeoutError::Disconnected) => LineEvent::Closed,
        }
    }

    /// Lines that have already arrived, without waiting.
    pub fn drain_available(&self) -> Vec<OutputLine> {
        self.lines.try_iter().collect()
    }

    /// Wait for the child to exit. `None` if it is still running after `wait`.
    pub fn wait_exit(&mut self, wait: Duration) -> Result<Option<ExitStatus>> {
        self.child.wait_timeout(wait).context("wait for child")
    }

    pub fn kill(&mut self) -> Result<ExitStatus> {
        if let Some(status) = self.child.try_wait().context("poll child")? {
            kill_process_group(self.child.id())?;
            return Ok(status);
        }
        kill_tree(&mut self.child)?;
        self.child.wait().context("wait child after kill")
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }
}

impl Drop for InteractiveChild {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            warn!(pid = self.child.id(), "interactive child still running, killing");
            let _ = kill_tree(&mut self.child);
            let _ = self.child.wait();
        }
    }
}

fn spawn_line_reader<R: Read + Send + 'static>(
    stream: StreamKind,
    reader: R,
    tx: Sender<OutputLine>,
) {
    thread::spawn(move || {
        let mut reader = BufReader::new(reader);
        loop {
            let mut line = Vec::new();
            match reader.read_until(b'\n', &mut line) {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&line).into_owned();
                    if tx.send(OutputLine { stream, text }).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    warn!(err = %err, ?stream, "read child output");
                    break;
                }
            }
        }
    });
}
