//! Built-in protocol probes.
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use super::job::CheckJob;
use super::registry::CheckerRegistry;

pub mod http;
pub mod ping;
pub mod port;

pub use http::HttpChecker;
pub use ping::PingChecker;
pub use port::PortChecker;

pub const DEFAULT_TIMEOUT_SECS: u64 = 10;
pub const MAX_TIMEOUT_SECS: u64 = 60;

/// Per-check timeout from `parameters.timeout` (seconds).
pub fn timeout_for(job: &CheckJob) -> Duration {
    let secs = job
        .param_u64("timeout")
        .unwrap_or(DEFAULT_TIMEOUT_SECS)
        .clamp(1, MAX_TIMEOUT_SECS);
    Duration::from_secs(secs)
}

/// Resolves `host`, reusing the address cached by an earlier attempt of the
/// same job. IPv4 is preferred unless `ipv6` is requested.
pub async fn resolve_target(job: &mut CheckJob, host: &str) -> std::io::Result<IpAddr> {
    if let Some(ip) = job.attempt.resolved_ip {
        return Ok(ip);
    }
    let ip = match host.parse::<IpAddr>() {
        Ok(ip) => ip,
        Err(_) => {
            let prefer_v6 = job.param_bool("ipv6").unwrap_or(false);
            let addrs: Vec<IpAddr> = tokio::net::lookup_host((host, 0))
                .await?
                .map(|addr| addr.ip())
                .collect();
            addrs
                .iter()
                .find(|ip| ip.is_ipv6() == prefer_v6)
                .or_else(|| addrs.first())
                .copied()
                .ok_or_else(|| {
                    std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("no addresses found for {host}"),
                    )
                })?
        }
    };
    job.attempt.resolved_ip = Some(ip);
    Ok(ip)
}

/// Registry with every built-in checker and its aliases.
pub fn default_registry() -> Result<CheckerRegistry, reqwest::Error> {
    let mut registry = CheckerRegistry::new();
    registry.register(Arc::new(HttpChecker::new()?));
    registry.register(Arc::new(PortChecker));
    registry.register(Arc::new(PingChecker));
    registry.alias("https", "http");
    registry.alias("tcp", "port");
    registry.alias("icmp", "ping");
    Ok(registry)
}
