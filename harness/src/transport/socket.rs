//! WebSocket transport to a running gateway.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::net::{Shutdown, TcpStream};
use std::time::{Duration, Instant};

use anyhow::{Context, anyhow};
use tracing::{debug, instrument, warn};
use tungstenite::{Message, WebSocket};

use super::frames::{Inbound, Outbound, interpret_event, summary_line};
use super::{Deadline, Transport, Turn};
use crate::error::{HarnessError, Result};
use crate::gateway::probe;
use crate::result::{RunnerResult, TurnRecord};

/// Upper bound for waiting on the gateway's close acknowledgement.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// One connection per runner call: handshake, one `chat.send` per turn, close.
pub struct SocketTransport {
    address: String,
}

impl SocketTransport {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

impl Transport for SocketTransport {
    #[instrument(skip_all, fields(address = %self.address, turns = turns.len()))]
    fn send(&self, turns: &[Turn], deadline: Deadline) -> Result<RunnerResult> {
        let mut connection = Connection::open(&self.address, deadline)?;
        connection.handshake()?;

        let mut transcript = Vec::with_capacity(turns.len());
        let mut exit_code = 0;
        for turn in turns {
            if turn.is_terminate() {
                transcript.push(TurnRecord {
                    turn: turn.text.clone(),
                    response: String::new(),
                });
                break;
            }
            let outcome = connection.chat(&turn.text)?;
            exit_code = if outcome.ok { 0 } else { 1 };
            transcript.push(TurnRecord {
                turn: turn.text.clone(),
                response: outcome.response,
            });
        }
        connection.close();
        Ok(RunnerResult::from_transcript(exit_code, transcript))
    }
}

struct TurnOutcome {
    response: String,
    ok: bool,
}

struct Connection {
    socket: WebSocket<TcpStream>,
    deadline: Deadline,
}

fn is_timeout(err: &std::io::Error) -> bool {
    matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

impl Connection {
    fn open(address: &str, deadline: Deadline) -> Result<Self> {
        let addrs = probe::socket_addrs(address)?;
        let remaining = deadline.remaining().ok_or_else(|| deadline.timed_out())?;

        let mut last_err = None;
        let mut stream = None;
        for addr in &addrs {
            match TcpStream::connect_timeout(addr, remaining) {
                Ok(connected) => {
                    stream = Some(connected);
                    break;
                }
                Err(err) if is_timeout(&err) => return Err(deadline.timed_out()),
                Err(err) => last_err = Some(err),
            }
        }
        let stream = match (stream, last_err) {
            (Some(stream), _) => stream,
            (None, Some(err)) => {
                return Err(anyhow::Error::new(err)
                    .context(format!("connect to gateway {address}"))
                    .into());
            }
            (None, None) => return Err(anyhow!("{address} resolved to no addresses").into()),
        };
        stream.set_nodelay(true).context("set TCP_NODELAY")?;
        stream
            .set_read_timeout(Some(remaining))
            .context("set read timeout")?;
        stream
            .set_write_timeout(Some(remaining))
            .context("set write timeout")?;

        let (socket, _response) = match tungstenite::client(address, stream) {
            Ok(pair) => pair,
            Err(tungstenite::HandshakeError::Interrupted(_)) => return Err(deadline.timed_out()),
            Err(tungstenite::HandshakeError::Failure(err)) => {
                return Err(anyhow!("websocket upgrade with {address} failed: {err}").into());
            }
        };
        debug!("websocket connected");
        Ok(Self { socket, deadline })
    }

    fn handshake(&mut self) -> Result<()> {
        self.write(&Outbound::hello())?;
        loop {
            let (frame, raw) = self.read_frame()?;
            match frame {
                Inbound::Welcome { session_id, .. } => {
                    debug!(%session_id, "gateway session established");
                    return Ok(());
                }
                Inbound::Challenge { .. } => {
                    return Err(HarnessError::protocol(
                        "gateway requested device authentication, operator sessions expect welcome",
                        raw,
                    ));
                }
                Inbound::Res { .. } => {
                    return Err(HarnessError::protocol("response before welcome", raw));
                }
                Inbound::Event { .. } | Inbound::Unknown => {
                    debug!(%raw, "ignoring frame before welcome");
                }
            }
        }
    }

    /// Send one message and stream its events until the completing `res`.
    #[instrument(skip_all)]
    fn chat(&mut self, message: &str) -> Result<TurnOutcome> {
        let started = Instant::now();
        let request = Outbound::chat(message);
        let mut pending: HashSet<String> = request.id().map(str::to_string).into_iter().collect();
        self.write(&request)?;

        let mut response = String::new();
        let mut tool_uses = 0u64;
        let mut tokens = 0u64;
        loop {
            let (frame, raw) = self.read_frame()?;
            match &frame {
                Inbound::Event { event, data } => {
                    let effect = interpret_event(event, data);
                    if let Some(text) = effect.text {
                        response.push_str(&text);
                    }
                    if effect.tool_call {
                        tool_uses += 1;
                    }
                    if let Some((input, output)) = effect.tokens {
                        tokens = input + output;
                    }
                    if let Some(params) = effect.resume {
                        let resume = Outbound::resume(params);
                        if let Some(id) = resume.id() {
                            pending.insert(id.to_string());
                        }
                        debug!(%event, "resuming yielded turn");
                        self.write(&resume)?;
                    }
                }
                Inbound::Res { id, ok, error, .. } => {
                    if !pending.contains(id) {
                        return Err(HarnessError::protocol("response to unknown request", raw));
                    }
                    if frame.is_yield() {
                        debug!(%id, "turn yielded");
                        continue;
                    }
                    if let Some(error) = error {
                        response.push_str(&format!("Error [{}]: {}\n", error.code, error.message));
                    }
                    response.push_str(&summary_line(
                        started.elapsed().as_secs_f64(),
                        tokens,
                        tool_uses,
                    ));
                    return Ok(TurnOutcome { response, ok: *ok });
                }
                Inbound::Welcome { .. } | Inbound::Challenge { .. } => {
                    return Err(HarnessError::protocol("handshake frame during a turn", raw));
                }
                Inbound::Unknown => debug!(%raw, "ignoring unknown frame"),
            }
        }
    }

    fn write(&mut self, frame: &Outbound) -> Result<()> {
        let text = serde_json::to_string(frame).context("serialize frame")?;
        let Some(left) = self.deadline.remaining() else {
            return Err(self.cancel());
        };
        self.socket
            .get_mut()
            .set_write_timeout(Some(left))
            .context("set write timeout")?;
        match self.socket.send(Message::Text(text)) {
            Ok(()) => Ok(()),
            Err(tungstenite::Error::Io(err)) if is_timeout(&err) => Err(self.cancel()),
            Err(err) => Err(anyhow!("send frame to gateway: {err}").into()),
        }
    }

    /// Next text frame, parsed, together with its raw text.
    fn read_frame(&mut self) -> Result<(Inbound, String)> {
        loop {
            let Some(left) = self.deadline.remaining() else {
                return Err(self.cancel());
            };
            self.socket
                .get_mut()
                .set_read_timeout(Some(left))
                .context("set read timeout")?;
            match self.socket.read() {
                Ok(Message::Text(text)) => {
                    return match serde_json::from_str::<Inbound>(&text) {
                        Ok(frame) => Ok((frame, text)),
                        Err(err) => Err(HarnessError::protocol(
                            format!("malformed frame: {err}"),
                            text,
                        )),
                    };
                }
                Ok(Message::Binary(bytes)) => {
                    return Err(HarnessError::protocol(
                        "unexpected binary frame",
                        String::from_utf8_lossy(&bytes).into_owned(),
                    ));
                }
                Ok(Message::Close(frame)) => {
                    return Err(HarnessError::protocol(
                        "gateway closed the connection mid-turn",
                        format!("{frame:?}"),
                    ));
                }
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
                Err(tungstenite::Error::Io(err)) if is_timeout(&err) => return Err(self.cancel()),
                Err(err) => {
                    return Err(HarnessError::protocol(
                        "websocket read failed",
                        err.to_string(),
                    ));
                }
            }
        }
    }

    /// Sever the connection after the deadline passed.
    fn cancel(&mut self) -> HarnessError {
        warn!(
            timeout_secs = self.deadline.timeout().as_secs(),
            "runner call timed out, closing gateway connection"
        );
        if let Err(err) = self.socket.get_ref().shutdown(Shutdown::Both) {
            debug!(err = %err, "shutdown gateway connection");
        }
        self.deadline.timed_out()
    }

    /// Close handshake; errors only mean the gateway already went away.
    fn close(mut self) {
        if let Err(err) = self.socket.close(None) {
            debug!(err = %err, "send close frame");
            return;
        }
        let grace = Deadline::after(CLOSE_GRACE);
        while let Some(left) = grace.remaining() {
            if self.socket.get_mut().set_read_timeout(Some(left)).is_err() {
                break;
            }
            match self.socket.read() {
                Ok(_) => {}
                Err(tungstenite::Error::ConnectionClosed) => {
                    debug!("gateway connection closed");
                    break;
                }
                Err(err) => {
                    debug!(err = %err, "waiting for close acknowledgement");
                    break;
                }
            }
        }
    }
}
