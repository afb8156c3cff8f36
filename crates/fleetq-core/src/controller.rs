//! Caller-side helpers for the dashboard's drain controller: merging results
//! across repeated drains and retrying rate-limited requests against a
//! running `fleetq serve` instance.
//!
//! This retry is independent of the status probe's retry inside the engine
//! and only ever retries HTTP 429 responses.

use std::future::Future;
use std::time::Duration;

use crate::drain::{DrainFailure, DrainRequest, DrainResult};
use crate::queue::{Message, MessageSet};

/// Attempts made by the dashboard for rate-limited requests.
pub const RETRY_ATTEMPTS: u32 = 3;
/// Fixed pause between those attempts.
pub const RETRY_DELAY: Duration = Duration::from_millis(4_000);

/// Appends `incoming` to `existing`, skipping messages whose id is already present.
pub fn merge_messages(existing: Vec<Message>, incoming: Vec<Message>) -> Vec<Message> {
    let mut set: MessageSet = existing.into_iter().collect();
    set.extend(incoming);
    set.into_vec()
}

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("rate limited by {url}")]
    RateLimited { url: String },
    #[error("{0}")]
    Failed(Box<DrainFailure>),
    #[error("unexpected response {status}: {body}")]
    Status { status: u16, body: String },
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl RemoteError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, RemoteError::RateLimited { .. })
    }
}

/// Fixed-delay retry of rate-limited calls.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: RETRY_ATTEMPTS,
            delay: RETRY_DELAY,
        }
    }
}

impl RetryPolicy {
    pub async fn run<T, F, Fut>(&self, mut call: F) -> Result<T, RemoteError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match call().await {
                Err(err) if err.is_rate_limited() && attempt < attempts => {
                    log::warn!("{err}; retrying in {}ms ({attempt}/{attempts})", self.delay.as_millis());
                    tokio::time::sleep(self.delay).await;
                }
                other => return other,
            }
        }
    }
}

#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct DrainBody<'a> {
    profile: &'a str,
    region: &'a str,
    queue_url: &'a str,
}

#[derive(serde::Deserialize)]
#[serde(untagged)]
enum DrainReply {
    Failure(DrainFailure),
    Result(DrainResult),
}

/// Turns a `POST /api/sqs-poll` response into a result.
///
/// The failure shape is recognised by its `error` field, whatever the status.
pub fn classify_reply(url: &str, status: u16, body: &str) -> Result<DrainResult, RemoteError> {
    if status == 429 {
        return Err(RemoteError::RateLimited {
            url: url.to_string(),
        });
    }

    match serde_json::from_str::<DrainReply>(body) {
        Ok(DrainReply::Result(result)) if (200..300).contains(&status) => Ok(result),
        Ok(DrainReply::Failure(failure)) => Err(RemoteError::Failed(Box::new(failure))),
        _ => Err(RemoteError::Status {
            status,
            body: body.to_string(),
        }),
    }
}

/// Drains through the HTTP API of a running `fleetq serve`.
pub struct RemoteDrain {
    http: reqwest::Client,
    base_url: String,
    policy: RetryPolicy,
}

impl RemoteDrain {
    pub fn new(base_url: &str) -> Self {
        Self::with_policy(base_url, RetryPolicy::default())
    }

    pub fn with_policy(base_url: &str, policy: RetryPolicy) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            policy,
        }
    }

    /// Runs one drain and merges its messages into `seen`.
    ///
    /// The returned result carries the merged message list, so repeated
    /// calls build up one de-duplicated view of the queue.
    pub async fn drain(
        &self,
        request: &DrainRequest,
        seen: &mut Vec<Message>,
    ) -> Result<DrainResult, RemoteError> {
        let url = format!("{}/api/sqs-poll", self.base_url);
        let body = DrainBody {
            profile: &request.profile,
            region: &request.region,
            queue_url: &request.queue_url,
        };

        let (http, url, body) = (&self.http, &url, &body);
        let mut result = self
            .policy
            .run(move || async move {
                let response = http.post(url).json(body).send().await?;
                let status = response.status().as_u16();
                let text = response.text().await?;
                classify_reply(url, status, &text)
            })
            .await?;

        let merged = merge_messages(std::mem::take(seen), result.messages);
        seen.clone_from(&merged);
        result.messages = merged;
        Ok(result)
    }
}
