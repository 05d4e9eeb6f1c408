//! Native gateway lifecycle with stand-in release binaries.
#![cfg(unix)]

use std::net::TcpListener;
use std::path::Path;
use std::time::{Duration, Instant};

use harness::HarnessError;
use harness::config::HarnessConfig;
use harness::gateway::probe::is_reachable;
use harness::gateway::{Gateway, GatewaySession, GatewayState, NativeGateway};
use harness::mode::resolve;
use harness::test_support::{process_alive, write_release_script};

const LISTEN_PORT_ENV: &str = "HARNESS_FAKE_GATEWAY_PORT";

/// Body of the fake gateway binary: re-enters this test executable in listener mode.
#[test]
#[ignore = "spawned by the native gateway tests as a stand-in gateway"]
fn fake_gateway_listener() {
    let Ok(port) = std::env::var(LISTEN_PORT_ENV) else {
        return;
    };
    let _listener = TcpListener::bind(format!("127.0.0.1:{port}")).expect("bind fake gateway");
    std::thread::sleep(Duration::from_secs(120));
}

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("bind")
        .local_addr()
        .expect("addr")
        .port()
}

fn config(startup_secs: u64) -> HarnessConfig {
    let mut config = HarnessConfig::default();
    config.gateway.startup_timeout_secs = startup_secs;
    config.gateway.stop_timeout_secs = 5;
    config.gateway.probe_initial_delay_ms = 20;
    config.gateway.probe_max_delay_ms = 200;
    config
}

fn install_agent_daemon(root: &Path) {
    write_release_script(root, "brainpro-agent", "echo \"agent on $2\"\nexec sleep 120");
}

fn install_listening_gateway(root: &Path) {
    let test_exe = std::env::current_exe().expect("current exe");
    write_release_script(
        root,
        "brainpro-gateway",
        &format!(
            "{LISTEN_PORT_ENV}=\"$2\" exec \"{}\" fake_gateway_listener --exact --ignored --nocapture",
            test_exe.display()
        ),
    );
}

#[test]
fn start_probe_stop_leaves_nothing_listening() {
    let temp = tempfile::tempdir().expect("tempdir");
    install_agent_daemon(temp.path());
    install_listening_gateway(temp.path());
    let address = format!("ws://127.0.0.1:{}/ws", free_port());

    let mut gateway = NativeGateway::new(temp.path(), address.clone(), &config(20));
    assert_eq!(gateway.start().expect("start"), address);
    assert_eq!(gateway.state(), GatewayState::Ready);
    assert_eq!(gateway.pids().len(), 2);
    assert!(is_reachable(&address, Duration::from_millis(200)));

    gateway.stop().expect("stop");
    gateway.stop().expect("stop is idempotent");
    assert_eq!(gateway.state(), GatewayState::Stopped);
    assert!(gateway.pids().is_empty());
    assert!(!is_reachable(&address, Duration::from_millis(200)));
}

fn wait_until_gone(pid: u32, limit: Duration) -> bool {
    let started = Instant::now();
    while started.elapsed() < limit {
        if !process_alive(pid) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    !process_alive(pid)
}

#[test]
fn stop_kills_processes_spawned_by_the_agent_daemon() {
    let temp = tempfile::tempdir().expect("tempdir");
    let pidfile = temp.path().join("worker.pid");
    write_release_script(
        temp.path(),
        "brainpro-agent",
        &format!(
            "sleep 120 &\necho $! > \"{}\"\nexec sleep 120",
            pidfile.display()
        ),
    );
    install_listening_gateway(temp.path());
    let address = format!("ws://127.0.0.1:{}/ws", free_port());

    let mut gateway = NativeGateway::new(temp.path(), address, &config(20));
    gateway.start().expect("start");
    let started = Instant::now();
    while !pidfile.exists() && started.elapsed() < Duration::from_secs(5) {
        std::thread::sleep(Duration::from_millis(20));
    }
    // The pid is written before the newline; wait for the whole line.
    std::thread::sleep(Duration::from_millis(50));
    let worker: u32 = std::fs::read_to_string(&pidfile)
        .expect("worker pidfile")
        .trim()
        .parse()
        .expect("worker pid");
    assert!(process_alive(worker));

    gateway.stop().expect("stop");
    assert!(
        wait_until_gone(worker, Duration::from_secs(5)),
        "worker {worker} survived teardown"
    );
}

#[test]
fn session_drop_tears_down_native_gateway() {
    let temp = tempfile::tempdir().expect("tempdir");
    install_agent_daemon(temp.path());
    install_listening_gateway(temp.path());
    let port = free_port();
    let mut config = config(20);
    config.gateway.port = Some(port);
    let address = format!("ws://localhost:{port}/ws");

    let template = resolve(Some("native"), temp.path()).expect("resolve");
    {
        let session = GatewaySession::open(template, &config).expect("open");
        assert_eq!(session.mode_config().gateway_address(), Some(address.as_str()));
        assert!(is_reachable(&address, Duration::from_millis(200)));
    }
    assert!(!is_reachable(&address, Duration::from_millis(200)));
}

#[test]
fn exiting_gateway_fails_fast_with_logs() {
    let temp = tempfile::tempdir().expect("tempdir");
    install_agent_daemon(temp.path());
    write_release_script(
        temp.path(),
        "brainpro-gateway",
        "echo \"bind: address already in use\" >&2\nexit 1",
    );
    let address = format!("ws://127.0.0.1:{}/ws", free_port());

    let mut gateway = NativeGateway::new(temp.path(), address, &config(30));
    let started = Instant::now();
    let err = gateway.start().expect_err("gateway exits");
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(err.is_session_fatal());
    match &err {
        HarnessError::GatewayStartup { diagnostics, .. } => {
            assert!(diagnostics.contains("address already in use"), "{diagnostics}");
            assert!(diagnostics.contains("=== brainpro-agent ==="), "{diagnostics}");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(gateway.state(), GatewayState::Failed);
    assert!(gateway.pids().is_empty(), "spawned processes were not killed");
}

#[test]
fn silent_gateway_times_out() {
    let temp = tempfile::tempdir().expect("tempdir");
    install_agent_daemon(temp.path());
    write_release_script(temp.path(), "brainpro-gateway", "echo starting\nexec sleep 120");
    let address = format!("ws://127.0.0.1:{}/ws", free_port());

    let mut gateway = NativeGateway::new(temp.path(), address, &config(1));
    let err = gateway.start().expect_err("never listens");
    match &err {
        HarnessError::GatewayStartup { message, diagnostics } => {
            assert!(message.contains("not reachable"), "{message}");
            assert!(diagnostics.contains("starting"), "{diagnostics}");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(gateway.pids().is_empty());
}
