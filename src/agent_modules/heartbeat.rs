use chrono::{DateTime, Timelike, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::System;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::checklist::Checklist;
use super::config::save_agent_config;
use super::context::AgentContext;
use super::job::{CheckJob, JobState, now_ms};
use super::scheduler::reconcile;
use crate::version::VERSION;

#[derive(Error, Debug)]
pub enum HeartbeatError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("Control plane did not answer within {0:?}")]
    Timeout(Duration),
    #[error("Failed to encode status: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Failed to decode control plane response: {0}")]
    Decode(serde_json::Error),
}

/// Aggregate status pushed with every heartbeat.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct AggregateStatus {
    pub version: String,
    pub hostname: String,
    pub checks: usize,
    pub up: usize,
    pub down: usize,
    pub pending: usize,
    pub lastcycle: i64,
}

impl AggregateStatus {
    pub fn from_checklist(checklist: &Checklist, hostname: String, lastcycle: i64) -> Self {
        Self {
            version: VERSION.to_string(),
            hostname,
            checks: checklist.len(),
            up: checklist.count_state(Some(JobState::Up)),
            down: checklist.count_state(Some(JobState::Down)),
            pending: checklist.count_state(None),
            lastcycle,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HeartbeatResponse {
    pub success: bool,
    pub config: Option<Map<String, Value>>,
    pub checklist: Option<Vec<CheckJob>>,
    pub error: Option<String>,
}

/// Response envelope with checklist entries left undecoded.
#[derive(Deserialize)]
struct RawHeartbeatResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    config: Option<Map<String, Value>>,
    #[serde(default)]
    checklist: Option<Vec<Value>>,
    #[serde(default)]
    error: Option<String>,
}

impl HeartbeatResponse {
    /// Decodes a response body. Checklist entries that do not describe a
    /// check are logged and skipped; the rest of the response still applies.
    pub fn from_body(body: &str) -> Result<Self, serde_json::Error> {
        let raw: RawHeartbeatResponse = serde_json::from_str(body)?;
        let checklist = raw.checklist.map(|entries| {
            entries
                .into_iter()
                .enumerate()
                .filter_map(|(index, entry)| {
                    let id = entry.get("id").map(Value::to_string).unwrap_or_default();
                    match serde_json::from_value::<CheckJob>(entry) {
                        Ok(job) => Some(job),
                        Err(e) => {
                            warn!(index, check_id = %id, error = %e, "Skipping malformed checklist entry.");
                            None
                        }
                    }
                })
                .collect()
        });
        Ok(Self {
            success: raw.success,
            config: raw.config,
            checklist,
            error: raw.error,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Synced {
        config_changed: bool,
        checklist_replaced: bool,
    },
    /// The control plane answered with an error; try again next minute.
    Rejected(String),
    /// The control plane no longer knows this agent's check.
    CheckRemoved,
}

/// The control plane reports a deleted check with a message along these lines.
fn is_check_removed(error: &str) -> bool {
    let lowered = error.to_ascii_lowercase();
    lowered.contains("not found") || lowered.contains("does not exist")
}

pub struct HeartbeatClient {
    client: Client,
    pub max_attempts: u32,
    pub backoff_step: Duration,
    pub request_timeout: Duration,
}

impl HeartbeatClient {
    pub fn new() -> Result<Self, HeartbeatError> {
        Ok(Self {
            client: Client::builder().connect_timeout(Duration::from_secs(4)).build()?,
            max_attempts: 3,
            backoff_step: Duration::from_secs(1),
            request_timeout: Duration::from_secs(5),
        })
    }

    async fn send_once(&self, url: &str, form: &[(&str, String)]) -> Result<String, HeartbeatError> {
        let request = self.client.post(url).form(form).send();
        let timeout = self.request_timeout;
        let body = tokio::time::timeout(timeout, async move { request.await?.text().await })
            .await
            .map_err(|_| HeartbeatError::Timeout(timeout))??;
        Ok(body)
    }

    /// Posts the heartbeat, retrying transport failures with linear backoff.
    /// A body that cannot be decoded is returned as an error without retrying.
    pub async fn send(&self, ctx: &AgentContext) -> Result<HeartbeatResponse, HeartbeatError> {
        let config = ctx.config();
        let (status, updatestamp) = ctx.store.read(|checklist| {
            (
                AggregateStatus::from_checklist(
                    checklist,
                    System::host_name().unwrap_or_else(|| "N/A".to_string()),
                    ctx.last_cycle(),
                ),
                checklist.update_stamp(),
            )
        });
        let form = [
            ("results", serde_json::to_string(&status)?),
            ("updatestamp", updatestamp.to_string()),
            ("check", config.check_id.clone()),
            ("checktoken", config.check_token.clone()),
        ];
        let url = config.heartbeat_url();

        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.send_once(&url, &form).await {
                Ok(body) => return HeartbeatResponse::from_body(&body).map_err(HeartbeatError::Decode),
                Err(e) if attempt < max_attempts => {
                    warn!(attempt, error = %e, "Heartbeat failed; retrying.");
                    tokio::time::sleep(self.backoff_step * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Applies a heartbeat response: config delta first, then any checklist
/// replacement, which is reconciled against the current checklist and flushed.
pub async fn handle_response(ctx: &AgentContext, response: HeartbeatResponse) -> HeartbeatOutcome {
    if !response.success {
        let message = response.error.unwrap_or_else(|| "unknown error".to_string());
        if is_check_removed(&message) {
            error!(error = %message, "Control plane no longer knows this agent's check. Disabling reporting.");
            ctx.disable_reporting();
            return HeartbeatOutcome::CheckRemoved;
        }
        warn!(error = %message, "Control plane rejected heartbeat.");
        return HeartbeatOutcome::Rejected(message);
    }

    let mut config_changed = false;
    if let Some(delta) = response.config.as_ref() {
        let updated = ctx.update_config(|config| config.apply_delta(delta).then(|| config.clone()));
        if let Some(config) = updated {
            config_changed = true;
            info!(check_interval = config.check_interval_secs(), "Applied config update from control plane.");
            if !config.config_path.is_empty() {
                if let Err(e) = save_agent_config(&config, &config.config_path) {
                    error!(error = %e, "Failed to save updated config.");
                }
            }
        }
    }

    let checklist_replaced = match response.checklist {
        Some(incoming) => {
            let now = now_ms();
            let (before, after) = ctx.store.update(|checklist| {
                let before = checklist.len();
                *checklist = reconcile(checklist, incoming, now);
                (before, checklist.len())
            });
            info!(before, after, "Reconciled checklist from control plane.");
            ctx.store.flush_logged().await;
            true
        }
        None => false,
    };

    HeartbeatOutcome::Synced {
        config_changed,
        checklist_replaced,
    }
}

/// Time until the next wall-clock second `offset_secs`.
pub fn until_next_heartbeat(now: DateTime<Utc>, offset_secs: u64) -> Duration {
    let millis = (now.nanosecond() / 1_000_000).min(999) as u64;
    let into_minute = now.second() as u64 * 1000 + millis;
    let target = (offset_secs % 60) * 1000;
    let wait = if into_minute < target {
        target - into_minute
    } else {
        60_000 - into_minute + target
    };
    Duration::from_millis(wait)
}

/// Sends a heartbeat once a minute at the agent's offset until shutdown or
/// until the control plane reports the check as removed.
pub async fn heartbeat_loop(
    ctx: Arc<AgentContext>,
    client: HeartbeatClient,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let offset = ctx.config().heartbeat_offset_secs();
        let wait = until_next_heartbeat(Utc::now(), offset);
        debug!(wait_ms = wait.as_millis() as u64, "Heartbeat task tick.");

        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => {
                info!("Shutdown signal received, stopping heartbeat.");
                break;
            }
            _ = tokio::time::sleep(wait) => {}
        }

        if !ctx.reporting_enabled() {
            break;
        }
        match client.send(&ctx).await {
            Ok(response) => {
                if handle_response(&ctx, response).await == HeartbeatOutcome::CheckRemoved {
                    break;
                }
            }
            Err(e) => error!(error = %e, "Heartbeat failed; will retry next minute."),
        }
    }
    info!("Heartbeat loop ended.");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_until_next_heartbeat() {
        let at = |s: u32| Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, s).unwrap();
        assert_eq!(until_next_heartbeat(at(0), 17), Duration::from_secs(17));
        assert_eq!(until_next_heartbeat(at(17), 17), Duration::from_secs(60));
        assert_eq!(until_next_heartbeat(at(30), 17), Duration::from_secs(47));
    }

    #[test]
    fn test_malformed_checklist_entries_are_skipped() {
        let body = r#"{
            "success": true,
            "config": {"check_interval": 30},
            "checklist": [
                {"id": "web", "type": "http", "interval": 1},
                {"id": "db", "type": "port", "interval": "5"},
                {"id": "broken", "interval": 1},
                {"id": "worse", "type": "http", "interval": "often"}
            ]
        }"#;

        let response = HeartbeatResponse::from_body(body).unwrap();

        assert!(response.success);
        assert!(response.config.unwrap().contains_key("check_interval"));
        let ids: Vec<String> = response.checklist.unwrap().into_iter().map(|job| job.id).collect();
        assert_eq!(ids, vec!["web", "db"]);
    }

    #[test]
    fn test_undecodable_body_is_an_error() {
        assert!(HeartbeatResponse::from_body("<html>502 Bad Gateway</html>").is_err());
        let minimal = HeartbeatResponse::from_body(r#"{"success": false}"#).unwrap();
        assert!(minimal.checklist.is_none() && minimal.error.is_none());
    }

    #[test]
    fn test_check_removed_detection() {
        assert!(is_check_removed("Check not found"));
        assert!(is_check_removed("This check does not exist"));
        assert!(!is_check_removed("Invalid token"));
    }

    #[test]
    fn test_aggregate_status_counts() {
        let mut up = CheckJob::new("a", "http", 1);
        up.state = Some(JobState::Up);
        let mut down = CheckJob::new("b", "http", 1);
        down.state = Some(JobState::Down);
        let pending = CheckJob::new("c", "http", 1);
        let checklist = Checklist::from_jobs(vec![up, down, pending]);

        let status = AggregateStatus::from_checklist(&checklist, "host-1".into(), 99);
        assert_eq!(
            (status.checks, status.up, status.down, status.pending),
            (3, 1, 1, 1)
        );
        assert_eq!(status.lastcycle, 99);
        assert_eq!(status.version, VERSION);
    }
}
