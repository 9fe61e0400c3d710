// src/core/health/mod.rs

//! Application-layer health checking for back-end instances, performed over
//! the anonymous network's SOCKS proxy. One probe function per check kind,
//! per spec.md §4.5 / §9 ("Polymorphism over health-check kinds is a sum
//! type ... with one probe function per variant").

mod socks;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Three-valued liveness as tracked on an `Instance`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Health {
    #[default]
    Unknown,
    Up,
    Down,
}

impl Health {
    pub fn is_up(self) -> bool {
        matches!(self, Health::Up)
    }
}

/// The configured health-check kind for a service, a closed sum type over
/// the probe protocols the manager knows how to speak.
#[derive(Debug, Clone, PartialEq)]
pub enum HealthCheck {
    /// No health checking: every instance is considered healthy unconditionally.
    None,
    Tcp {
        port: u16,
        timeout: Duration,
    },
    Http {
        port: u16,
        path: String,
        timeout: Duration,
    },
    Https {
        port: u16,
        path: String,
        timeout: Duration,
    },
}

impl HealthCheck {
    pub fn is_none(&self) -> bool {
        matches!(self, HealthCheck::None)
    }
}

/// The user-agent sent by HTTP(S) probes, per spec.md §4.5.
pub fn user_agent() -> String {
    format!("OnionBalance/{}", env!("CARGO_PKG_VERSION"))
}

/// The outcome of a single probe attempt.
#[derive(Debug, Clone, Copy)]
pub struct ProbeOutcome {
    pub healthy: bool,
    pub start: DateTime<Utc>,
    pub elapsed: Duration,
}

/// Runs the configured health check against `onion_address` (without the
/// `.onion` suffix) and returns the outcome. Never blocks the caller for
/// longer than the configured timeout (plus the SOCKS handshake itself,
/// which is cheap).
pub async fn probe(check: &HealthCheck, onion_address: &str, socks_addr: SocketAddr) -> ProbeOutcome {
    let start = Utc::now();
    let t0 = tokio::time::Instant::now();

    let healthy = match check {
        HealthCheck::None => true,
        HealthCheck::Tcp { port, timeout: to } => probe_tcp(onion_address, *port, *to, socks_addr).await,
        HealthCheck::Http { port, path, timeout: to } => {
            probe_http("http", onion_address, *port, path, *to, socks_addr).await
        }
        HealthCheck::Https { port, path, timeout: to } => {
            probe_http("https", onion_address, *port, path, *to, socks_addr).await
        }
    };

    ProbeOutcome {
        healthy,
        start,
        elapsed: t0.elapsed(),
    }
}

async fn probe_tcp(onion_address: &str, port: u16, to: Duration, socks_addr: SocketAddr) -> bool {
    debug!("checking TCP {}.onion:{}", onion_address, port);
    let target = format!("{onion_address}.onion");
    let fut = async {
        let stream = TcpStream::connect(socks_addr).await?;
        socks::connect(stream, &target, port).await
    };
    match timeout(to, fut).await {
        Ok(Ok(_stream)) => true,
        Ok(Err(e)) => {
            debug!("TCP probe to {}:{} failed: {}", target, port, e);
            false
        }
        Err(_) => {
            debug!("TCP probe to {}:{} timed out after {:?}", target, port, to);
            false
        }
    }
}

async fn probe_http(
    scheme: &str,
    onion_address: &str,
    port: u16,
    path: &str,
    to: Duration,
    socks_addr: SocketAddr,
) -> bool {
    let path = path.trim_start_matches('/');
    let url = format!("{scheme}://{onion_address}.onion:{port}/{path}");
    debug!("checking {}", url);

    let proxy = match reqwest::Proxy::all(format!("socks5h://{socks_addr}")) {
        Ok(p) => p,
        Err(e) => {
            debug!("failed to build SOCKS proxy for health check: {}", e);
            return false;
        }
    };

    let client = match reqwest::Client::builder()
        .proxy(proxy)
        .timeout(to)
        .user_agent(user_agent())
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            debug!("failed to build HTTP client for health check: {}", e);
            return false;
        }
    };

    match client.get(&url).send().await {
        Ok(resp) if resp.status().is_success() => {
            // Read at most 1 KiB of the body, per spec.md §4.5.
            let _ = read_capped(resp, 1024).await;
            true
        }
        Ok(resp) => {
            debug!("{} returned status {}", url, resp.status());
            false
        }
        Err(e) => {
            debug!("request to {} failed: {}", url, e);
            false
        }
    }
}

async fn read_capped(resp: reqwest::Response, cap: usize) -> Vec<u8> {
    // Capped defensively so a misbehaving instance can't stream an
    // unbounded response at the prober.
    match resp.bytes().await {
        Ok(bytes) => bytes.iter().take(cap).copied().collect(),
        Err(_) => Vec::new(),
    }
}

/// A health-check configuration block as it appears (pre-validation) in the
/// config file.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum HealthCheckConfigEntry {
    None,
    Tcp {
        port: u16,
        #[serde(with = "humantime_serde", default = "default_timeout")]
        timeout: Duration,
    },
    Http {
        port: u16,
        #[serde(default = "default_path")]
        path: String,
        #[serde(with = "humantime_serde", default = "default_timeout")]
        timeout: Duration,
    },
    Https {
        port: u16,
        #[serde(default = "default_path")]
        path: String,
        #[serde(with = "humantime_serde", default = "default_timeout")]
        timeout: Duration,
    },
}

fn default_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_path() -> String {
    "/".to_string()
}

impl From<HealthCheckConfigEntry> for HealthCheck {
    fn from(entry: HealthCheckConfigEntry) -> Self {
        match entry {
            HealthCheckConfigEntry::None => HealthCheck::None,
            HealthCheckConfigEntry::Tcp { port, timeout } => HealthCheck::Tcp { port, timeout },
            HealthCheckConfigEntry::Http { port, path, timeout } => HealthCheck::Http { port, path, timeout },
            HealthCheckConfigEntry::Https { port, path, timeout } => HealthCheck::Https { port, path, timeout },
        }
    }
}
