//! Runner calls through a gateway session against an in-process WebSocket gateway.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use harness::HarnessError;
use harness::config::HarnessConfig;
use harness::gateway::{GatewaySession, GatewayState};
use harness::mode::resolve;
use harness::test_support::{
    CountingGateway, GatewayCounters, ServerConnection, echo_agent, spawn_ws_gateway,
};
use serde_json::json;
use tungstenite::Message;

fn config(timeout_secs: u64) -> HarnessConfig {
    HarnessConfig {
        call_timeout_secs: timeout_secs,
        ..HarnessConfig::default()
    }
}

fn session_for(address: &str) -> (GatewaySession, GatewayCounters) {
    let template = resolve(Some("native"), Path::new("/srv/project")).expect("resolve");
    let gateway = CountingGateway::new(address);
    let counters = gateway.counters();
    let session = GatewaySession::open_with(template, Some(Box::new(gateway))).expect("open");
    (session, counters)
}

#[test]
fn session_is_started_once_for_many_calls() {
    let server = spawn_ws_gateway(echo_agent);
    let config = config(10);
    let (session, counters) = session_for(server.address());

    for n in 0..3 {
        let runner = session.runner(&config).expect("runner");
        let result = runner.oneshot(&format!("prompt {n}")).expect("oneshot");
        assert_eq!(result.exit_code, 0);
        assert!(result.output.contains(&format!("echo: prompt {n}")), "{}", result.output);
        assert!(result.output.contains("[Duration: "));
    }

    assert_eq!(counters.starts(), 1);
    assert_eq!(server.connections(), 3);
    assert_eq!(session.state(), Some(GatewayState::Ready));
    session.close().expect("close");
    assert_eq!(counters.effective_stops(), 1);
}

#[test]
fn repl_turns_share_one_connection_in_order() {
    let server = spawn_ws_gateway(echo_agent);
    let config = config(10);
    let (session, _) = session_for(server.address());

    let result = session
        .runner(&config)
        .expect("runner")
        .repl([
            "Read src/lib.rs and remember its function's name",
            "What was the name of the function you just read?",
            "/exit",
        ])
        .expect("repl");

    assert_eq!(server.connections(), 1);
    assert_eq!(result.transcript.len(), 3);
    assert!(
        result.transcript[1]
            .response
            .contains("(previous: Read src/lib.rs and remember its function's name)")
    );
    assert_eq!(result.transcript[2].turn, "/exit");
    assert_eq!(result.transcript[2].response, "");
    assert_eq!(
        result.output,
        result
            .transcript
            .iter()
            .map(|record| record.response.as_str())
            .collect::<String>()
    );

    let frames = server.received();
    let kinds: Vec<&str> = frames
        .iter()
        .map(|frame| frame["type"].as_str().unwrap_or_default())
        .collect();
    assert_eq!(kinds[..3], ["hello", "req", "req"]);
}

#[test]
fn approvals_are_granted_and_tool_calls_are_visible() {
    let server = spawn_ws_gateway(|conn: &mut ServerConnection| {
        conn.accept_hello();
        let Some((id, _)) = conn.recv_chat() else {
            return;
        };
        conn.event(
            "agent.awaiting_approval",
            json!({"turn_id": "t1", "tool_call_id": "c1", "tool_name": "Write",
                   "tool_args": {"file_path": "fixtures/scratch/test.txt"}}),
        );
        conn.send(json!({"type": "res", "id": id, "ok": true, "payload": {"status": "yielded"}}));

        let resume = conn.recv().expect("resume");
        assert_eq!(resume["method"], "turn.resume");
        assert_eq!(resume["params"]["approved"], true);
        let resume_id = resume["id"].as_str().unwrap_or_default().to_string();

        conn.event(
            "agent.tool_call",
            json!({"name": "Write", "args": {"file_path": "fixtures/scratch/test.txt"}}),
        );
        conn.event("agent.tool_result", json!({"name": "Write", "ok": true}));
        conn.event("agent.message", json!({"text": "Created the file."}));
        conn.complete(&resume_id, true);
    });
    let config = config(10);
    let (session, _) = session_for(server.address());

    let result = session
        .runner(&config)
        .expect("runner")
        .oneshot("Create a file")
        .expect("oneshot");
    assert_eq!(result.exit_code, 0);
    assert!(result.output.contains("⚠ Auto-approved: Write("));
    assert!(result.output.contains("⏺ Write(file_path: \"fixtures/scratch/test.txt\")"));
    assert!(result.output.contains("  ⎿ ✓ Write"));
    assert!(result.output.contains("Created the file."));
}

#[test]
fn failed_turn_sets_nonzero_exit_code() {
    let server = spawn_ws_gateway(|conn: &mut ServerConnection| {
        conn.accept_hello();
        if let Some((id, _)) = conn.recv_chat() {
            conn.event("agent.error", json!({"code": "max_turns", "message": "turn limit"}));
            conn.complete(&id, false);
        }
    });
    let config = config(10);
    let (session, _) = session_for(server.address());

    let result = session
        .runner(&config)
        .expect("runner")
        .oneshot("loop forever")
        .expect("oneshot");
    assert_eq!(result.exit_code, 1);
    assert!(result.output.contains("Error [max_turns]: turn limit"));
}

#[test]
fn malformed_frame_is_a_protocol_error_with_payload() {
    let server = spawn_ws_gateway(|conn: &mut ServerConnection| {
        conn.accept_hello();
        if conn.recv_chat().is_some() {
            conn.send_raw(Message::Text("not json".to_string()));
        }
    });
    let config = config(10);
    let (session, _) = session_for(server.address());

    let err = session
        .runner(&config)
        .expect("runner")
        .oneshot("hi")
        .expect_err("protocol error");
    assert!(!err.is_session_fatal());
    match err {
        HarnessError::RunnerProtocol { payload, .. } => assert_eq!(payload, "not json"),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn challenge_before_welcome_is_rejected() {
    let server = spawn_ws_gateway(|conn: &mut ServerConnection| {
        if conn.recv().is_some() {
            conn.send(json!({"type": "challenge", "nonce": "abc"}));
        }
    });
    let config = config(10);
    let (session, _) = session_for(server.address());

    let err = session
        .runner(&config)
        .expect("runner")
        .oneshot("hi")
        .expect_err("challenge");
    assert!(matches!(err, HarnessError::RunnerProtocol { .. }), "{err}");
}

#[test]
fn silent_gateway_times_out_and_connection_is_severed() {
    let disconnected = Arc::new(AtomicBool::new(false));
    let seen = Arc::clone(&disconnected);
    let server = spawn_ws_gateway(move |conn: &mut ServerConnection| {
        conn.accept_hello();
        if conn.recv_chat().is_some() && conn.recv().is_none() {
            seen.store(true, Ordering::SeqCst);
        }
    });
    let config = config(1);
    let (session, _) = session_for(server.address());

    let started = Instant::now();
    let err = session
        .runner(&config)
        .expect("runner")
        .oneshot("never answered")
        .expect_err("timeout");
    assert!(matches!(err, HarnessError::RunnerTimeout { .. }), "{err}");
    assert!(started.elapsed() < Duration::from_secs(5));

    let wait = Instant::now();
    while !disconnected.load(Ordering::SeqCst) && wait.elapsed() < Duration::from_secs(5) {
        std::thread::sleep(Duration::from_millis(20));
    }
    assert!(disconnected.load(Ordering::SeqCst), "gateway still sees the connection");
}
