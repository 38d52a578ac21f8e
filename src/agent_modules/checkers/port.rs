use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Instant;

use super::{resolve_target, timeout_for};
use crate::agent_modules::job::{CheckJob, CheckResult, now_ms};
use crate::agent_modules::registry::Checker;

/// TCP connect probe against `parameters.target` : `parameters.port`.
pub struct PortChecker;

fn target_and_port(job: &CheckJob) -> Result<(String, u16), String> {
    let target = job.param_str("target").ok_or("Missing target")?;
    let port = job.param_u64("port").ok_or("Missing port")?;
    match u16::try_from(port) {
        Ok(port) if port > 0 => Ok((target.to_string(), port)),
        _ => Err(format!("Invalid port: {port}")),
    }
}

#[async_trait]
impl Checker for PortChecker {
    fn name(&self) -> &'static str {
        "port"
    }

    async fn check(&self, job: &mut CheckJob) -> CheckResult {
        let result = CheckResult::started_at(now_ms());
        let (target, port) = match target_and_port(job) {
            Ok(parts) => parts,
            Err(reason) => return result.invalid(reason),
        };
        let timeout_duration = timeout_for(job);

        let start_time = Instant::now();
        let connect = async {
            let ip = resolve_target(job, &target).await?;
            tokio::net::TcpStream::connect(SocketAddr::new(ip, port)).await
        };
        let outcome = tokio::time::timeout(timeout_duration, connect).await;
        let response_time_ms = start_time.elapsed().as_millis() as f64;

        match outcome {
            Ok(Ok(_stream)) => result
                .up("connected", "Connection successful")
                .track("responsetime", response_time_ms),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                result.down("refused", format!("Error: {e}"))
            }
            Ok(Err(e)) => result.down("error", format!("Error: {e}")),
            Err(_) => result.down("timeout", "Error: Connection timed out"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_open_port_is_up_and_caches_address() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut job = CheckJob::new("a", "port", 1)
            .with_parameter("target", json!("127.0.0.1"))
            .with_parameter("port", json!(port));

        let result = PortChecker.check(&mut job).await;

        assert!(result.success, "{}", result.message);
        assert_eq!(result.status_code, "connected");
        assert!(result.fieldtracking.unwrap().contains_key("responsetime"));
        assert_eq!(job.attempt.resolved_ip, Some(IpAddr::V4(Ipv4Addr::LOCALHOST)));
    }

    #[tokio::test]
    async fn test_closed_port_is_down() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let mut job = CheckJob::new("a", "port", 1)
            .with_parameter("target", json!("127.0.0.1"))
            .with_parameter("port", json!(port.to_string()));

        let result = PortChecker.check(&mut job).await;

        assert!(!result.success);
        assert!(!result.override_debounce);
    }

    #[tokio::test]
    async fn test_bad_parameters_are_validation_errors() {
        let mut missing_port = CheckJob::new("a", "port", 1).with_parameter("target", json!("db"));
        let result = PortChecker.check(&mut missing_port).await;
        assert!(result.override_debounce);
        assert_eq!(result.message, "Missing port");

        let mut bad_port = CheckJob::new("a", "port", 1)
            .with_parameter("target", json!("db"))
            .with_parameter("port", json!(70000));
        let result = PortChecker.check(&mut bad_port).await;
        assert!(result.override_debounce);
        assert_eq!(result.message, "Invalid port: 70000");
    }
}
