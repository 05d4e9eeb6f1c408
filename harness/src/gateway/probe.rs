//! TCP readiness probe with bounded exponential backoff.

use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};
use url::Url;

/// Retry schedule for the readiness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbePolicy {
    /// Delay after the first failed attempt; doubled after each further failure.
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Budget for a single connect attempt.
    pub connect_timeout: Duration,
    /// Overall budget across all attempts.
    pub total: Duration,
}

/// Why the gateway never became reachable.
#[derive(Debug)]
pub enum ProbeFailure {
    /// The overall budget elapsed.
    TimedOut { attempts: u32, last_error: String },
    /// The liveness check reported that the gateway cannot come up anymore.
    Aborted(anyhow::Error),
}

impl std::fmt::Display for ProbeFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeFailure::TimedOut {
                attempts,
                last_error,
            } => write!(
                f,
                "not reachable after {attempts} attempts (last error: {last_error})"
            ),
            ProbeFailure::Aborted(err) => write!(f, "{err:#}"),
        }
    }
}

/// `host:port` socket addresses of a `ws://` / `wss://` gateway address.
pub fn socket_addrs(address: &str) -> Result<Vec<SocketAddr>> {
    let url = Url::parse(address).with_context(|| format!("parse gateway address {address}"))?;
    let host = url
        .host_str()
        .ok_or_else(|| anyhow!("gateway address {address} has no host"))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| anyhow!("gateway address {address} has no port"))?;
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .with_context(|| format!("resolve {host}:{port}"))?
        .collect();
    if addrs.is_empty() {
        return Err(anyhow!("{host}:{port} resolved to no addresses"));
    }
    Ok(addrs)
}

/// Port of a gateway address.
pub fn port_of(address: &str) -> Result<u16> {
    Url::parse(address)
        .with_context(|| format!("parse gateway address {address}"))?
        .port_or_known_default()
        .ok_or_else(|| anyhow!("gateway address {address} has no port"))
}

/// Same address with its port replaced.
pub fn with_port(address: &str, port: u16) -> Result<String> {
    let mut url =
        Url::parse(address).with_context(|| format!("parse gateway address {address}"))?;
    url.set_port(Some(port))
        .map_err(|()| anyhow!("gateway address {address} cannot carry a port"))?;
    Ok(url.to_string())
}

/// Single connect attempt against every resolved address.
pub fn try_connect(addrs: &[SocketAddr], timeout: Duration) -> std::io::Result<()> {
    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect_timeout(addr, timeout) {
            Ok(_) => return Ok(()),
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err.unwrap_or_else(|| std::io::Error::other("no addresses to connect to")))
}

/// Whether something currently accepts TCP connections at `address`.
pub fn is_reachable(address: &str, connect_timeout: Duration) -> bool {
    socket_addrs(address)
        .map(|addrs| try_connect(&addrs, connect_timeout).is_ok())
        .unwrap_or(false)
}

/// Poll `address` until it accepts a TCP connection.
///
/// `liveness` runs before every attempt; returning an error aborts the probe
/// immediately (e.g. a gateway process exited during startup).
#[instrument(skip_all, fields(address = %address, total_ms = policy.total.as_millis() as u64))]
pub fn wait_until_reachable<F>(
    address: &str,
    policy: &ProbePolicy,
    mut liveness: F,
) -> Result<Duration, ProbeFailure>
where
    F: FnMut() -> Result<()>,
{
    let addrs = socket_addrs(address).map_err(ProbeFailure::Aborted)?;
    let started = Instant::now();
    let deadline = started + policy.total;
    let mut delay = policy.initial_delay;
    let mut attempts = 0u32;

    loop {
        liveness().map_err(ProbeFailure::Aborted)?;

        attempts += 1;
        let now = Instant::now();
        let connect_budget = policy
            .connect_timeout
            .min(deadline.saturating_duration_since(now))
            .max(Duration::from_millis(1));
        let last_error = match try_connect(&addrs, connect_budget) {
            Ok(()) => {
                let elapsed = started.elapsed();
                debug!(attempts, elapsed_ms = elapsed.as_millis() as u64, "gateway reachable");
                return Ok(elapsed);
            }
            Err(err) => err.to_string(),
        };

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(ProbeFailure::TimedOut {
                attempts,
                last_error,
            });
        }
        debug!(attempts, delay_ms = delay.as_millis() as u64, %last_error, "gateway not ready");
        thread::sleep(delay.min(remaining));
        delay = (delay * 2).min(policy.max_delay);
    }
}
