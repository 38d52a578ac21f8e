use async_trait::async_trait;
use rand::random;
use std::net::IpAddr;
use surge_ping::{Client, Config, ICMP, PingIdentifier, PingSequence, SurgeError};

use super::{resolve_target, timeout_for};
use crate::agent_modules::job::{CheckJob, CheckResult, now_ms};
use crate::agent_modules::registry::Checker;

/// ICMP echo probe. Needs raw-socket privileges; without them every attempt
/// reports an error result rather than failing agent startup.
pub struct PingChecker;

fn icmp_client(ip: IpAddr) -> std::io::Result<Client> {
    let config = match ip {
        IpAddr::V4(_) => Config::default(),
        IpAddr::V6(_) => Config::builder().kind(ICMP::V6).build(),
    };
    Client::new(&config)
}

#[async_trait]
impl Checker for PingChecker {
    fn name(&self) -> &'static str {
        "ping"
    }

    async fn check(&self, job: &mut CheckJob) -> CheckResult {
        let result = CheckResult::started_at(now_ms());
        let Some(target) = job.param_str("target").map(str::to_string) else {
            return result.invalid("Missing target");
        };
        let timeout_duration = timeout_for(job);

        let target_addr = match tokio::time::timeout(timeout_duration, resolve_target(job, &target)).await {
            Ok(Ok(ip)) => ip,
            Ok(Err(e)) => return result.down("dns", format!("Error: {e}")),
            Err(_) => return result.down("timeout", "Error: Name resolution timed out"),
        };
        let client = match icmp_client(target_addr) {
            Ok(client) => client,
            Err(e) => return result.down("error", format!("Error: ICMP socket unavailable: {e}")),
        };

        let mut pinger = client.pinger(target_addr, PingIdentifier(random())).await;
        pinger.timeout(timeout_duration);
        match pinger.ping(PingSequence(0), &[0; 16]).await {
            Ok((_reply, duration)) => {
                let rtt = duration.as_secs_f64() * 1000.0;
                result
                    .up("reply", format!("{rtt:.1} ms"))
                    .track("rtt", rtt)
            }
            Err(SurgeError::Timeout { .. }) => result.down("timeout", "Error: No echo reply"),
            Err(e) => result.down("error", format!("Error: {e}")),
        }
    }
}
