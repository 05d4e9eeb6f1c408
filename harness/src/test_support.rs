//! Fakes for exercising the harness without a real agent build.
//!
//! Enabled for unit tests and, through the `test-support` feature, for the
//! integration tests and downstream crates.

use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use serde_json::{Value, json};
use tungstenite::{Message, WebSocket};

use crate::error::Result;
use crate::gateway::{Gateway, GatewayState, Lifecycle};
use crate::mode::{binary_path, release_dir};

/// Shared view of a [`CountingGateway`]'s calls.
#[derive(Debug, Clone, Default)]
pub struct GatewayCounters {
    inner: Arc<CounterCells>,
}

#[derive(Debug, Default)]
struct CounterCells {
    starts: AtomicUsize,
    stops: AtomicUsize,
    effective_stops: AtomicUsize,
}

impl GatewayCounters {
    /// Calls to `start`.
    pub fn starts(&self) -> usize {
        self.inner.starts.load(Ordering::SeqCst)
    }

    /// Calls to `stop`.
    pub fn stops(&self) -> usize {
        self.inner.stops.load(Ordering::SeqCst)
    }

    /// Calls to `stop` that actually stopped a ready gateway.
    pub fn effective_stops(&self) -> usize {
        self.inner.effective_stops.load(Ordering::SeqCst)
    }
}

/// Gateway that starts nothing and reports a fixed address.
pub struct CountingGateway {
    address: String,
    lifecycle: Lifecycle,
    counters: GatewayCounters,
}

impl CountingGateway {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            lifecycle: Lifecycle::new(),
            counters: GatewayCounters::default(),
        }
    }

    pub fn counters(&self) -> GatewayCounters {
        self.counters.clone()
    }
}

impl Gateway for CountingGateway {
    fn start(&mut self) -> Result<String> {
        self.counters.inner.starts.fetch_add(1, Ordering::SeqCst);
        if let Some(address) = self.lifecycle.begin_start()? {
            return Ok(address);
        }
        self.lifecycle.ready(self.address.clone());
        Ok(self.address.clone())
    }

    fn stop(&mut self) -> Result<()> {
        self.counters.inner.stops.fetch_add(1, Ordering::SeqCst);
        if self.lifecycle.begin_stop() {
            self.counters
                .inner
                .effective_stops
                .fetch_add(1, Ordering::SeqCst);
            self.lifecycle.stopped();
        }
        Ok(())
    }

    fn state(&self) -> GatewayState {
        self.lifecycle.state()
    }
}

/// Write an executable `sh` script to `<root>/target/release/<name>`.
#[cfg(unix)]
pub fn write_release_script(project_root: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let dir = release_dir(project_root);
    std::fs::create_dir_all(&dir).expect("create release dir");
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod script");
    path
}

/// Stand-in for the agent binary at the conventional path.
#[cfg(unix)]
pub fn write_fake_agent(project_root: &Path, body: &str) -> PathBuf {
    let name = binary_path(project_root)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .expect("binary name");
    write_release_script(project_root, &name, body)
}

/// Whether `pid` names a live process. Zombies awaiting reaping count as gone.
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if kill(Pid::from_raw(raw), None).is_err() {
        return false;
    }
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => {
            let state = stat
                .rsplit_once(')')
                .and_then(|(_, rest)| rest.split_whitespace().next());
            state != Some("Z")
        }
        Err(_) => true,
    }
}

/// Server side of one scripted gateway connection.
pub struct ServerConnection {
    socket: WebSocket<TcpStream>,
    received: Arc<Mutex<Vec<Value>>>,
}

impl ServerConnection {
    /// Next JSON text frame from the client. `None` once the client closes.
    pub fn recv(&mut self) -> Option<Value> {
        loop {
            match self.socket.read() {
                Ok(Message::Text(text)) => {
                    let value: Value = serde_json::from_str(&text).expect("client sent JSON");
                    self.received.lock().expect("lock").push(value.clone());
                    return Some(value);
                }
                Ok(Message::Close(_)) => {
                    self.received
                        .lock()
                        .expect("lock")
                        .push(json!({"type": "__close__"}));
                }
                Ok(_) => {}
                Err(_) => return None,
            }
        }
    }

    pub fn send(&mut self, frame: Value) {
        // The client may already be gone when a test aborts a turn.
        let _ = self.socket.send(Message::Text(frame.to_string()));
    }

    pub fn send_raw(&mut self, message: Message) {
        let _ = self.socket.send(message);
    }

    /// Expect `hello`, answer `welcome`.
    pub fn accept_hello(&mut self) {
        let hello = self.recv().expect("hello");
        assert_eq!(hello["type"], "hello");
        self.send(json!({
            "type": "welcome",
            "session_id": "test-session",
            "policy": {"mode": "default", "max_turns": 12},
        }));
    }

    /// Next `chat.send` request as `(id, message)`.
    pub fn recv_chat(&mut self) -> Option<(String, String)> {
        let frame = self.recv()?;
        assert_eq!(frame["method"], "chat.send", "{frame}");
        Some((
            frame["id"].as_str().unwrap_or_default().to_string(),
            frame["params"]["message"]
                .as_str()
                .unwrap_or_default()
                .to_string(),
        ))
    }

    pub fn event(&mut self, event: &str, data: Value) {
        self.send(json!({"type": "event", "event": event, "data": data}));
    }

    pub fn complete(&mut self, id: &str, ok: bool) {
        self.send(json!({"type": "res", "id": id, "ok": ok, "payload": {"status": "completed"}}));
    }
}

/// In-process WebSocket gateway driven by a per-connection script.
pub struct ScriptedGateway {
    address: String,
    connections: Arc<AtomicUsize>,
    received: Arc<Mutex<Vec<Value>>>,
}

impl ScriptedGateway {
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Connections accepted so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Every frame received on any connection, in arrival order.
    pub fn received(&self) -> Vec<Value> {
        self.received.lock().expect("lock").clone()
    }
}

/// Bind `127.0.0.1:0` and run `script` for every accepted connection.
pub fn spawn_ws_gateway<F>(script: F) -> ScriptedGateway
where
    F: Fn(&mut ServerConnection) + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let connections = Arc::new(AtomicUsize::new(0));
    let received = Arc::new(Mutex::new(Vec::new()));
    let script = Arc::new(script);

    let accepted = Arc::clone(&connections);
    let log = Arc::clone(&received);
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { continue };
            accepted.fetch_add(1, Ordering::SeqCst);
            let script = Arc::clone(&script);
            let log = Arc::clone(&log);
            thread::spawn(move || {
                let Ok(socket) = tungstenite::accept(stream) else {
                    return;
                };
                let mut connection = ServerConnection {
                    socket,
                    received: log,
                };
                (*script)(&mut connection);
                // Drain until the client goes away so its close handshake completes.
                while connection.recv().is_some() {}
            });
        }
    });

    ScriptedGateway {
        address: format!("ws://127.0.0.1:{port}/ws"),
        connections,
        received,
    }
}

/// Script of a well-behaved agent: every message is answered with
/// `echo: <message>` plus the previous message of the same connection.
pub fn echo_agent(connection: &mut ServerConnection) {
    connection.accept_hello();
    let mut previous: Option<String> = None;
    while let Some((id, message)) = connection.recv_chat() {
        connection.event("agent.thinking", json!({"content": ""}));
        let mut text = format!("echo: {message}");
        if let Some(previous) = &previous {
            text.push_str(&format!(" (previous: {previous})"));
        }
        connection.event("agent.message", json!({"text": text}));
        connection.event(
            "agent.done",
            json!({"input_tokens": 10, "output_tokens": 5}),
        );
        connection.complete(&id, true);
        previous = Some(message);
    }
}
