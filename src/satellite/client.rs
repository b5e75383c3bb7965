//! HTTP client for the head: target fetch and report submission.

use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use reqwest::{StatusCode, Url};
use thiserror::Error;

use crate::models::{ReportPacket, Target};
use crate::protocol::{
    payload_hash, AGENT_VERSION, AUTH_HEADER, CONFIG_VERSION_HEADER, PAYLOAD_HASH_HEADER,
    VERSION_HEADER,
};

/// Submission error types.
#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("invalid head address: {0}")]
    Address(String),
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("head answered {status}: {detail}")]
    Status { status: u16, detail: String },
    #[error("failed to encode report: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Bounded retry for submissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Fixed delay between attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(5),
        }
    }
}

/// How a submission ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Delivered,
    /// The head holds a newer configuration than this satellite.
    StaleConfig,
    /// The head refused the report; retrying would not help.
    Rejected(u16),
    /// Every attempt failed in transit or with a server error.
    Discarded { attempts: u32 },
}

/// Destination of report packets.
pub trait Submitter: Send + Sync + 'static {
    fn submit(
        &self,
        packet: &ReportPacket,
    ) -> impl Future<Output = Result<SubmitOutcome, SubmitError>> + Send;
}

/// Client bound to one head and one satellite identity.
pub struct HeadClient {
    client: reqwest::Client,
    base: Url,
    satellite: String,
    secret: String,
    retry: RetryPolicy,
    config_version: AtomicI64,
}

impl HeadClient {
    pub fn new(
        head: &str,
        satellite: &str,
        secret: &str,
        request_timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self, SubmitError> {
        let head = if head.contains("://") {
            head.to_string()
        } else {
            format!("http://{}", head)
        };
        let base = Url::parse(&head).map_err(|e| SubmitError::Address(format!("{}: {}", head, e)))?;
        if base.cannot_be_a_base() {
            return Err(SubmitError::Address(head));
        }

        let client = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            client,
            base,
            satellite: satellite.to_string(),
            secret: secret.to_string(),
            retry: RetryPolicy {
                max_attempts: retry.max_attempts.max(1),
                ..retry
            },
            config_version: AtomicI64::new(0),
        })
    }

    /// Configuration version from the last successful fetch.
    pub fn config_version(&self) -> i64 {
        self.config_version.load(Ordering::SeqCst)
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, SubmitError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| SubmitError::Address(self.base.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Fetch this satellite's targets and remember the configuration version.
    pub async fn fetch_targets(&self) -> Result<Vec<Target>, SubmitError> {
        let url = self.endpoint(&["satellites", &self.satellite, "targets"])?;
        let resp = self
            .client
            .get(url)
            .header(AUTH_HEADER, &self.secret)
            .header(VERSION_HEADER, AGENT_VERSION)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SubmitError::Status {
                status: status.as_u16(),
                detail: error_detail(&body),
            });
        }

        let version = resp
            .headers()
            .get(CONFIG_VERSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        let targets: Vec<Target> = resp.json().await?;
        self.config_version.store(version, Ordering::SeqCst);

        tracing::info!(
            "Fetched {} targets from head at configuration version {}",
            targets.len(),
            version
        );
        Ok(targets)
    }

    async fn submit_packet(&self, packet: &ReportPacket) -> Result<SubmitOutcome, SubmitError> {
        let url = self.endpoint(&["satellites", &self.satellite, &packet.target_name, "metrics"])?;
        let body = serde_json::to_vec(packet)?;
        let hash = payload_hash(&body);
        let version = self.config_version().to_string();
        let max_attempts = self.retry.max_attempts;

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                tokio::time::sleep(self.retry.backoff).await;
            }

            let result = self
                .client
                .put(url.clone())
                .header(AUTH_HEADER, &self.secret)
                .header(VERSION_HEADER, AGENT_VERSION)
                .header(CONFIG_VERSION_HEADER, &version)
                .header(PAYLOAD_HASH_HEADER, &hash)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body.clone())
                .send()
                .await;

            match result {
                Ok(resp) => {
                    let status = resp.status();
                    // Drain body for connection reuse.
                    let _ = resp.bytes().await;

                    if status == StatusCode::NO_CONTENT {
                        return Ok(SubmitOutcome::StaleConfig);
                    }
                    if status.is_success() {
                        return Ok(SubmitOutcome::Delivered);
                    }
                    if !is_transient(status) {
                        return Ok(SubmitOutcome::Rejected(status.as_u16()));
                    }
                    tracing::warn!(
                        target_name = %packet.target_name,
                        attempt,
                        "Head answered {}, will retry",
                        status
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        target_name = %packet.target_name,
                        attempt,
                        "Submission failed: {}",
                        e
                    );
                }
            }
        }

        Ok(SubmitOutcome::Discarded {
            attempts: max_attempts,
        })
    }
}

impl Submitter for HeadClient {
    fn submit(
        &self,
        packet: &ReportPacket,
    ) -> impl Future<Output = Result<SubmitOutcome, SubmitError>> + Send {
        self.submit_packet(packet)
    }
}

fn is_transient(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
}

/// `detail` of the head's error envelope, or the raw body.
fn error_detail(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("detail").and_then(|d| d.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.to_string())
}
