//! Queue status probe: a cheap attribute fetch run before polling.

use std::time::Duration;

use crate::error::ProviderError;
use crate::queue::QueueService;

/// Approximate queue depth at one instant.
///
/// SQS counters are eventually consistent, so an empty snapshot does not
/// mean the queue is empty.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatusSnapshot {
    pub has_messages: bool,
    pub visible_messages: u64,
    pub in_flight_messages: u64,
    pub total_messages: u64,
}

impl QueueStatusSnapshot {
    pub fn new(visible_messages: u64, in_flight_messages: u64) -> Self {
        Self {
            has_messages: visible_messages > 0,
            visible_messages,
            in_flight_messages,
            total_messages: visible_messages + in_flight_messages,
        }
    }
}

/// Time limit and retry budget of the status probe.
#[derive(Debug, Clone)]
pub struct ProbePolicy {
    /// Limit on each attempt.
    pub timeout: Duration,
    /// Total attempts, including the first.
    pub attempts: u32,
    /// Pause between a failed attempt and the next one.
    pub retry_interval: Duration,
}

impl Default for ProbePolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(5_000),
            attempts: 2,
            retry_interval: Duration::from_millis(1_000),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProbeError {
    #[error("queue status check timed out after {}ms", .0.as_millis())]
    TimedOut(Duration),
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl ProbeError {
    pub fn provider(&self) -> Option<&ProviderError> {
        match self {
            ProbeError::Provider(err) => Some(err),
            ProbeError::TimedOut(_) => None,
        }
    }
}

/// Fetches the queue's approximate counts, retrying failed or timed-out
/// attempts until the policy's attempt budget is spent.
pub async fn probe_status<Q>(
    queue: &Q,
    queue_url: &str,
    policy: &ProbePolicy,
) -> Result<QueueStatusSnapshot, ProbeError>
where
    Q: QueueService + ?Sized,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;

        let err = match tokio::time::timeout(policy.timeout, queue.fetch_status(queue_url)).await
        {
            Ok(Ok(snapshot)) => return Ok(snapshot),
            Ok(Err(err)) => ProbeError::Provider(err),
            Err(_) => ProbeError::TimedOut(policy.timeout),
        };

        if attempt >= attempts {
            return Err(err);
        }

        log::warn!(
            "status check for {} failed (attempt {}/{}): {}",
            queue_url,
            attempt,
            attempts,
            err
        );
        tokio::time::sleep(policy.retry_interval).await;
    }
}
