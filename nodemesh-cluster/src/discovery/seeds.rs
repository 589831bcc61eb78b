//! Seed list parsing and DNS expansion
//!
//! A seed is an IP literal, `host:port`, or a name that resolves to several
//! peers. Seeds without a port use the engine's bind port.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::error::{Error, Result};

/// Address lookup for one name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuery {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DnsResponse {
    pub answers: Vec<IpAddr>,
}

/// Sends a DNS query to `server` and returns the answer with its round-trip time
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DnsExchange: Send + Sync {
    async fn exchange(&self, query: &DnsQuery, server: &str) -> Result<(DnsResponse, Duration)>;
}

/// Answers through the operating system resolver; `server` is ignored
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

#[async_trait]
impl DnsExchange for SystemResolver {
    async fn exchange(&self, query: &DnsQuery, _server: &str) -> Result<(DnsResponse, Duration)> {
        let started = Instant::now();
        let addrs = tokio::net::lookup_host((query.name.as_str(), 0))
            .await
            .map_err(|e| {
                Error::Configuration(format!("DNS lookup failed for '{}': {e}", query.name))
            })?;
        let answers = addrs.map(|a| a.ip()).collect();
        Ok((DnsResponse { answers }, started.elapsed()))
    }
}

/// Split a seed into host and port
fn split_seed(seed: &str, default_port: u16) -> Result<(String, u16)> {
    if let Ok(addr) = seed.parse::<SocketAddr>() {
        return Ok((addr.ip().to_string(), addr.port()));
    }
    if seed.parse::<IpAddr>().is_ok() {
        return Ok((seed.to_string(), default_port));
    }
    match seed.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| Error::Configuration(format!("Invalid port in seed '{seed}'")))?;
            if host.is_empty() {
                return Err(Error::Configuration(format!("Missing host in seed '{seed}'")));
            }
            Ok((host.to_string(), port))
        }
        None => Ok((seed.to_string(), default_port)),
    }
}

/// Expand a comma separated seed list into `ip:port` peers
///
/// Seeds that fail to parse or resolve are logged and skipped.
pub async fn resolve_seeds(
    seeds: &str,
    default_port: u16,
    dns: &dyn DnsExchange,
    dns_server: &str,
) -> Vec<String> {
    let mut peers = Vec::new();
    let mut seen = HashSet::new();

    for seed in seeds.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (host, port) = match split_seed(seed, default_port) {
            Ok(parts) => parts,
            Err(e) => {
                tracing::warn!(seed = %seed, error = %e, "Skipping seed");
                continue;
            }
        };

        let ips = if let Ok(ip) = host.parse::<IpAddr>() {
            vec![ip]
        } else {
            let query = DnsQuery { name: host.clone() };
            match dns.exchange(&query, dns_server).await {
                Ok((response, rtt)) => {
                    tracing::debug!(
                        seed = %seed,
                        answers = response.answers.len(),
                        rtt_ms = rtt.as_millis() as u64,
                        "Seed resolved"
                    );
                    if response.answers.is_empty() {
                        tracing::warn!(seed = %seed, "Seed resolved to no addresses");
                    }
                    response.answers
                }
                Err(e) => {
                    tracing::warn!(seed = %seed, error = %e, "Skipping unresolvable seed");
                    continue;
                }
            }
        };

        for ip in ips {
            let addr = SocketAddr::new(ip, port).to_string();
            if seen.insert(addr.clone()) {
                peers.push(addr);
            }
        }
    }

    peers
}
