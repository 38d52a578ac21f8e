use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url, header::LOCATION, redirect::Policy};
use serde_json::json;
use std::time::Instant;
use thiserror::Error;

use super::timeout_for;
use crate::agent_modules::job::{CheckJob, CheckResult, now_ms};
use crate::agent_modules::registry::Checker;

const MAX_REDIRECTS: usize = 5;

#[derive(Error, Debug)]
enum FetchError {
    #[error("{0}")]
    Request(#[from] reqwest::Error),
    #[error("Too many redirects")]
    TooManyRedirects,
    #[error("Invalid redirect location: {0}")]
    BadLocation(String),
}

/// GET probe. Redirects are followed by hand so the chain can be reported.
/// 2xx counts as up, and so does a 3xx the probe was allowed to follow;
/// with `parameters.follow` false any 3xx is down.
pub struct HttpChecker {
    client: Client,
}

impl HttpChecker {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .redirect(Policy::none())
            .user_agent(concat!("probe-agent/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    async fn fetch(&self, job: &mut CheckJob, mut url: Url, follow: bool) -> Result<StatusCode, FetchError> {
        loop {
            let response = self.client.get(url.clone()).send().await?;
            let status = response.status();
            if !(follow && status.is_redirection()) {
                return Ok(status);
            }
            let Some(location) = response.headers().get(LOCATION).and_then(|v| v.to_str().ok()) else {
                return Ok(status);
            };
            if job.attempt.redirects.len() >= MAX_REDIRECTS {
                return Err(FetchError::TooManyRedirects);
            }
            let next = url
                .join(location)
                .map_err(|e| FetchError::BadLocation(e.to_string()))?;
            job.attempt.redirects.push(next.to_string());
            url = next;
        }
    }
}

/// Target URL, or the reason the check can never run.
fn target_url(job: &CheckJob) -> Result<Url, String> {
    let target = job.param_str("target").ok_or("Missing target")?;
    let url = Url::parse(target).map_err(|e| format!("Invalid URL: {e}"))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(format!("Disallowed protocol: {other}")),
    }
}

#[async_trait]
impl Checker for HttpChecker {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn check(&self, job: &mut CheckJob) -> CheckResult {
        let result = CheckResult::started_at(now_ms());
        let url = match target_url(job) {
            Ok(url) => url,
            Err(reason) => return result.invalid(reason),
        };
        let follow = job.param_bool("follow").unwrap_or(true);
        let timeout = timeout_for(job);
        job.attempt.redirects.clear();

        let start_time = Instant::now();
        let outcome = tokio::time::timeout(timeout, self.fetch(job, url, follow)).await;
        let response_time_ms = start_time.elapsed().as_millis() as f64;
        let diag = json!({ "redirects": job.attempt.redirects });

        match outcome {
            Ok(Ok(status)) => {
                let code = status.as_u16().to_string();
                let result = if status.is_success() || (follow && status.is_redirection()) {
                    result.up(code, status.to_string())
                } else {
                    result.down(code, status.to_string())
                };
                result
                    .with_diag(diag)
                    .track("responsetime", response_time_ms)
            }
            Ok(Err(e)) => result.down("error", format!("Error: {e}")).with_diag(diag),
            Err(_) => result
                .down("timeout", "Error: Request timed out")
                .with_diag(diag),
        }
    }
}
