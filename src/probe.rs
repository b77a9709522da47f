//! TCP and HTTP probes answering "is something listening" and "is it ready".
use std::{
    net::{IpAddr, SocketAddr, TcpStream},
    thread,
    time::{Duration, Instant},
};

use reqwest::{blocking::Client, redirect::Policy};
use tracing::debug;

use crate::constants::{
    HTTP_PROBE_TIMEOUT, PORT_PROBE_TIMEOUT, PROBE_HOSTS, PROCESS_CHECK_INTERVAL,
    READY_POLL_INTERVAL,
};

/// Result of a bounded readiness wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// The endpoint answered in time.
    Ready,
    /// The deadline passed first.
    TimedOut,
    /// The caller's abort predicate fired before the deadline.
    Aborted,
}

/// Side-effect-free checks against services on the local host.
///
/// Both IPv4 and IPv6 loopback are dialled, so a service bound to `localhost`
/// is seen whichever family it picked. Nothing is cached: every call asks the
/// operating system again.
#[derive(Debug, Clone)]
pub struct PortProbe {
    hosts: Vec<IpAddr>,
    connect_timeout: Duration,
    poll_interval: Duration,
}

impl Default for PortProbe {
    fn default() -> Self {
        Self {
            hosts: PROBE_HOSTS.to_vec(),
            connect_timeout: PORT_PROBE_TIMEOUT,
            poll_interval: READY_POLL_INTERVAL,
        }
    }
}

impl PortProbe {
    /// Creates a probe targeting localhost with the default timings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the interval between readiness polls.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Interval between readiness polls.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Returns true when a TCP connection to `port` succeeds within the connect bound.
    pub fn is_port_in_use(&self, port: u16) -> bool {
        self.connect_within(port, self.connect_timeout)
    }

    /// Polls until `port` (and `path`, when given) is ready or `timeout` elapses.
    pub fn wait_ready(&self, port: u16, path: Option<&str>, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        self.wait_ready_until(port, path, deadline, || false) == Readiness::Ready
    }

    /// Polls until ready, `deadline` passes, or `abort` returns true.
    ///
    /// Every individual probe is clamped to the time remaining, so the call
    /// returns shortly after `deadline` even when the endpoint hangs.
    pub fn wait_ready_until<F>(
        &self,
        port: u16,
        path: Option<&str>,
        deadline: Instant,
        mut abort: F,
    ) -> Readiness
    where
        F: FnMut() -> bool,
    {
        let client = match path {
            Some(_) => match build_client() {
                Ok(client) => Some(client),
                Err(err) => {
                    debug!("Unable to build readiness client for port {port}: {err}");
                    None
                }
            },
            None => None,
        };

        let mut attempt = 0u32;
        loop {
            if abort() {
                return Readiness::Aborted;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Readiness::TimedOut;
            }

            attempt += 1;
            let ready = match (path, client.as_ref()) {
                (Some(path), Some(client)) => self.http_ready(client, port, path, remaining),
                _ => self.connect_within(port, remaining.min(self.connect_timeout)),
            };
            if ready {
                debug!("Port {port} ready after {attempt} probe(s)");
                return Readiness::Ready;
            }

            let next_poll = Instant::now() + self.poll_interval;
            let wake = next_poll.min(deadline);
            while Instant::now() < wake {
                if abort() {
                    return Readiness::Aborted;
                }
                let left = wake.saturating_duration_since(Instant::now());
                thread::sleep(left.min(PROCESS_CHECK_INTERVAL));
            }
        }
    }

    /// HTTP GET against each loopback address; 2xx and 3xx count as ready.
    fn http_ready(&self, client: &Client, port: u16, path: &str, remaining: Duration) -> bool {
        let deadline = Instant::now() + remaining;
        self.hosts.iter().any(|host| {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return false;
            }
            // `SocketAddr` brackets IPv6 hosts, as URLs require.
            let url = format!("http://{}{path}", SocketAddr::new(*host, port));
            match client.get(&url).timeout(left.min(HTTP_PROBE_TIMEOUT)).send() {
                Ok(response) => {
                    let status = response.status();
                    debug!("Readiness probe {url} returned {status}");
                    status.is_success() || status.is_redirection()
                }
                Err(err) => {
                    debug!("Readiness probe {url} failed: {err}");
                    false
                }
            }
        })
    }

    /// TCP connect to each loopback address, all within `timeout` in total.
    fn connect_within(&self, port: u16, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        self.hosts.iter().any(|host| {
            let left = deadline.saturating_duration_since(Instant::now());
            !left.is_zero()
                && TcpStream::connect_timeout(&SocketAddr::new(*host, port), left).is_ok()
        })
    }
}

fn build_client() -> reqwest::Result<Client> {
    Client::builder()
        .timeout(HTTP_PROBE_TIMEOUT)
        .redirect(Policy::none())
        .build()
}
