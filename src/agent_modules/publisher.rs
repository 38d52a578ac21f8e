//! Delivers finalized jobs to the result collector.
//!
//! Delivery is best effort and at most once. Only transport failures are
//! retried; anything the collector answers is final.
use reqwest::Client;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::job::CheckJob;

/// The only body the collector sends on success.
pub const SUCCESS_BODY: &str = r#"{"success":true}"#;

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("Collector did not answer within {0:?}")]
    Timeout(Duration),
    #[error("Failed to encode job: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Delivered,
    /// Collector asked us to slow down; not retried.
    Throttled(String),
    /// Collector rejected the result; not retried.
    Rejected(String),
    /// Every attempt failed at the transport layer.
    Dropped { attempts: u32 },
    /// Reporting is switched off for this agent.
    Skipped,
}

#[derive(Debug, Clone)]
pub struct PublisherSettings {
    pub max_attempts: u32,
    /// Delay before retry `n` is `n * backoff_step`.
    pub backoff_step: Duration,
    pub connect_timeout: Duration,
    /// Application-level deadline for one request, independent of the
    /// socket-level timeouts.
    pub request_deadline: Duration,
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            backoff_step: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(4),
            request_deadline: Duration::from_millis(4500),
        }
    }
}

pub struct ResultPublisher {
    client: Client,
    url: String,
    check_id: String,
    check_token: String,
    settings: PublisherSettings,
}

impl ResultPublisher {
    pub fn new(
        url: impl Into<String>,
        check_id: impl Into<String>,
        check_token: impl Into<String>,
        settings: PublisherSettings,
    ) -> Result<Self, PublishError> {
        let client = Client::builder()
            .connect_timeout(settings.connect_timeout)
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
            check_id: check_id.into(),
            check_token: check_token.into(),
            settings,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Posts one finalized job, retrying transport failures with linear
    /// backoff up to `max_attempts` attempts.
    pub async fn publish(&self, job: &CheckJob) -> PublishOutcome {
        let payload = match serde_json::to_string(job) {
            Ok(payload) => payload,
            Err(e) => {
                let e = PublishError::from(e);
                error!(check_id = %job.id, error = %e, "Dropping result.");
                return PublishOutcome::Rejected(e.to_string());
            }
        };

        let max_attempts = self.settings.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            match self.send_once(&payload).await {
                Ok(body) => return self.classify(&job.id, body),
                Err(e) => {
                    warn!(check_id = %job.id, attempt, error = %e, "Failed to deliver result.");
                    if attempt < max_attempts {
                        tokio::time::sleep(self.settings.backoff_step * attempt).await;
                    }
                }
            }
        }

        error!(
            check_id = %job.id,
            attempts = max_attempts,
            "Giving up on result delivery; dropping result."
        );
        PublishOutcome::Dropped {
            attempts: max_attempts,
        }
    }

    async fn send_once(&self, payload: &str) -> Result<String, PublishError> {
        let request = self
            .client
            .post(&self.url)
            .form(&[
                ("results", payload),
                ("agent", self.check_id.as_str()),
                ("checktoken", self.check_token.as_str()),
            ])
            .send();
        let deadline = self.settings.request_deadline;
        let body = tokio::time::timeout(deadline, async move { request.await?.text().await })
            .await
            .map_err(|_| PublishError::Timeout(deadline))??;
        Ok(body)
    }

    fn classify(&self, check_id: &str, body: String) -> PublishOutcome {
        if body == SUCCESS_BODY {
            debug!(check_id = %check_id, "Result delivered.");
            PublishOutcome::Delivered
        } else if body.to_ascii_lowercase().contains("throttl") {
            info!(check_id = %check_id, response = %body, "Collector is throttling results; not retrying.");
            PublishOutcome::Throttled(body)
        } else {
            error!(check_id = %check_id, response = %body, "Collector rejected result.");
            PublishOutcome::Rejected(body)
        }
    }
}
