//! The drain engine: a time-boxed, read-only sweep of a queue.
//!
//! A drain runs a status probe, one immediate receive ("quick poll") and then
//! a sequence of long-poll receives until the time budget or poll budget is
//! spent. Every network call is raced against the caller's cancellation token
//! and a per-phase timer. A phase timer firing means "nothing yet", not an
//! error.
//!
//! Received messages are never deleted or released; they become visible to
//! other consumers again once their visibility timeout expires.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::is_throttling_code;
use crate::progress::ProgressReporter;
use crate::queue::{Message, MessageSet, QueueService, ReceiveRequest};
use crate::race::{or_cancel, race, Race};
use crate::status::{probe_status, ProbeError, ProbePolicy, QueueStatusSnapshot};

/// Phase label carried by progress updates and results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    StatusCheck,
    QuickPoll,
    LongPoll,
    /// The overall budget ran out; only used as a final progress label.
    Timeout,
    Aborted,
    Error,
    /// The drain ran to the end of its budget; only used as a final progress label.
    Completed,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::StatusCheck => "status-check",
            Strategy::QuickPoll => "quick-poll",
            Strategy::LongPoll => "long-poll",
            Strategy::Timeout => "timeout",
            Strategy::Aborted => "aborted",
            Strategy::Error => "error",
            Strategy::Completed => "completed",
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timing and sizing of a drain call.
#[derive(Debug, Clone)]
pub struct DrainSettings {
    /// Hard wall-clock budget of the whole call.
    pub budget: Duration,
    /// Client-side limit on the immediate receive.
    pub quick_poll_timeout: Duration,
    /// Server-side wait requested by each long-poll receive.
    pub long_poll_wait: Duration,
    /// Client-side limit on each long-poll receive.
    pub long_poll_timeout: Duration,
    pub max_messages: i32,
    pub visibility_timeout: Duration,
    pub probe: ProbePolicy,
    /// How often the progress channel refreshes the elapsed time.
    pub progress_interval: Duration,
}

impl Default for DrainSettings {
    fn default() -> Self {
        Self {
            budget: Duration::from_millis(300_000),
            quick_poll_timeout: Duration::from_millis(3_000),
            long_poll_wait: Duration::from_secs(20),
            long_poll_timeout: Duration::from_millis(22_000),
            max_messages: 10,
            visibility_timeout: Duration::from_secs(30),
            probe: ProbePolicy::default(),
            progress_interval: Duration::from_millis(250),
        }
    }
}

impl DrainSettings {
    /// Number of long polls that fit in `remaining`, rounded up.
    pub fn max_long_polls(&self, remaining: Duration) -> u32 {
        let per_poll = self.long_poll_timeout.as_millis().max(1);
        remaining.as_millis().div_ceil(per_poll) as u32
    }

    fn receive_request(&self, wait_time: Duration) -> ReceiveRequest {
        ReceiveRequest {
            max_messages: self.max_messages,
            wait_time,
            visibility_timeout: self.visibility_timeout,
        }
    }
}

/// What to drain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainRequest {
    pub profile: String,
    pub region: String,
    pub queue_url: String,
}

/// Outcome of a drain call that got past the status check.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainResult {
    /// Received messages, first-seen order, at most one per message id.
    pub messages: Vec<Message>,
    pub aborted: bool,
    pub poll_count: u32,
    pub time_elapsed_ms: u64,
    pub strategy: Strategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_status: Option<QueueStatusSnapshot>,
}

/// A drain that failed before polling, with the context an operator needs.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize, thiserror::Error)]
#[serde(rename_all = "camelCase")]
#[error("{error}")]
pub struct DrainFailure {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    pub profile: String,
    pub region: String,
    pub queue_id: String,
    pub time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_error_message: Option<String>,
    pub strategy: Strategy,
}

impl DrainFailure {
    /// True when the status check was turned away by provider throttling.
    pub fn is_throttled(&self) -> bool {
        self.provider_error_code
            .as_deref()
            .is_some_and(is_throttling_code)
    }

    fn status_check(request: &DrainRequest, err: &ProbeError) -> Self {
        let provider = err.provider();
        let mut chain = Vec::new();
        let mut source = std::error::Error::source(err);
        while let Some(cause) = source {
            chain.push(cause.to_string());
            source = cause.source();
        }

        Self {
            error: format!("queue status check failed: {err}"),
            stack: (!chain.is_empty()).then(|| chain.join("\n")),
            profile: request.profile.clone(),
            region: request.region.clone(),
            queue_id: request.queue_url.clone(),
            time: Utc::now(),
            provider_error_code: provider.and_then(|p| p.code.clone()),
            provider_error_message: provider.map(|p| p.message.clone()),
            strategy: Strategy::StatusCheck,
        }
    }
}

/// Accumulated state of one drain call.
struct Sweep {
    started: Instant,
    messages: MessageSet,
    polls: u32,
    status: Option<QueueStatusSnapshot>,
}

impl Sweep {
    fn finish(self, strategy: Strategy, aborted: bool, last_error: Option<String>) -> DrainResult {
        DrainResult {
            messages: self.messages.into_vec(),
            aborted,
            poll_count: self.polls,
            time_elapsed_ms: self.started.elapsed().as_millis() as u64,
            strategy,
            last_error,
            queue_status: self.status,
        }
    }
}

/// Runs drain calls against one queue service.
pub struct Drainer<Q> {
    queue: Q,
    settings: DrainSettings,
}

impl<Q: QueueService> Drainer<Q> {
    pub fn new(queue: Q) -> Self {
        Self::with_settings(queue, DrainSettings::default())
    }

    pub fn with_settings(queue: Q, settings: DrainSettings) -> Self {
        Self { queue, settings }
    }

    /// Drains `request.queue_url` until the budget is spent or `cancel` fires.
    ///
    /// Only a failed status check is returned as `Err`. Receive errors,
    /// cancellation and timeouts all produce a [`DrainResult`] carrying
    /// whatever was received so far.
    pub async fn drain(
        &self,
        request: &DrainRequest,
        cancel: &CancellationToken,
        mut progress: ProgressReporter,
    ) -> Result<DrainResult, DrainFailure> {
        let settings = &self.settings;
        let started = Instant::now();
        let _ticker = progress.start(started, settings.progress_interval);
        let url = request.queue_url.as_str();

        let mut sweep = Sweep {
            started,
            messages: MessageSet::default(),
            polls: 0,
            status: None,
        };

        progress.report(Strategy::StatusCheck, 0);
        log::debug!("checking status of {url}");
        let status = match or_cancel(probe_status(&self.queue, url, &settings.probe), cancel).await {
            Some(Ok(status)) => status,
            Some(Err(err)) => {
                let failure = DrainFailure::status_check(request, &err);
                log::error!(
                    "drain of {} failed (profile={} region={} code={:?}): {}",
                    url,
                    request.profile,
                    request.region,
                    failure.provider_error_code,
                    failure.error
                );
                progress.report(Strategy::Error, 0);
                return Err(failure);
            }
            None => {
                progress.report(Strategy::Aborted, 0);
                return Ok(self.finished(url, sweep.finish(Strategy::Aborted, true, None)));
            }
        };
        sweep.status = Some(status);

        // the counts are approximate, so an empty snapshot still gets polled
        sweep.polls = 1;
        progress.report(Strategy::QuickPoll, sweep.polls);
        let quick = settings.receive_request(Duration::ZERO);
        match race(self.queue.receive(url, &quick), cancel, settings.quick_poll_timeout).await {
            Race::Settled(Ok(batch)) if !batch.is_empty() => {
                sweep.messages.extend(batch);
                progress.report(Strategy::Completed, sweep.polls);
                return Ok(self.finished(url, sweep.finish(Strategy::QuickPoll, false, None)));
            }
            Race::Settled(Ok(_)) => log::debug!("quick poll of {url} returned nothing"),
            Race::TimedOut => log::debug!("quick poll of {url} timed out"),
            Race::Cancelled => {
                progress.report(Strategy::Aborted, sweep.polls);
                return Ok(self.finished(url, sweep.finish(Strategy::Aborted, true, None)));
            }
            Race::Settled(Err(err)) => {
                log::error!(
                    "quick poll of {} failed (profile={} region={} code={:?}): {}",
                    url,
                    request.profile,
                    request.region,
                    err.code,
                    err
                );
                progress.report(Strategy::Error, sweep.polls);
                let result = sweep.finish(Strategy::Error, false, Some(err.to_string()));
                return Ok(self.finished(url, result));
            }
        }

        let remaining = settings.budget.saturating_sub(started.elapsed());
        let max_polls = settings.max_long_polls(remaining);
        let long = settings.receive_request(settings.long_poll_wait);
        let mut iterations = 0;
        let mut aborted = false;
        let mut last_error = None;
        log::debug!("long polling {url} for up to {max_polls} polls");

        while started.elapsed() < settings.budget && iterations < max_polls {
            iterations += 1;
            sweep.polls += 1;
            progress.report(Strategy::LongPoll, sweep.polls);

            match race(self.queue.receive(url, &long), cancel, settings.long_poll_timeout).await {
                Race::Settled(Ok(batch)) => {
                    let received = batch.len();
                    let added = sweep.messages.extend(batch);
                    log::debug!("long poll {iterations} of {url}: {received} received, {added} new");
                }
                Race::TimedOut => log::debug!("long poll {iterations} of {url} timed out"),
                Race::Cancelled => {
                    aborted = true;
                    break;
                }
                Race::Settled(Err(err)) => {
                    log::error!(
                        "long poll {} of {} failed (profile={} region={} code={:?}): {}",
                        iterations,
                        url,
                        request.profile,
                        request.region,
                        err.code,
                        err
                    );
                    last_error = Some(err.to_string());
                    break;
                }
            }
        }

        let label = if aborted {
            Strategy::Aborted
        } else if last_error.is_some() {
            Strategy::Error
        } else if started.elapsed() >= settings.budget {
            Strategy::Timeout
        } else {
            Strategy::Completed
        };
        progress.report(label, sweep.polls);

        Ok(self.finished(url, sweep.finish(Strategy::LongPoll, aborted, last_error)))
    }

    fn finished(&self, url: &str, result: DrainResult) -> DrainResult {
        log::info!(
            "drained {}: strategy={} polls={} messages={} aborted={} elapsed={}ms",
            url,
            result.strategy,
            result.poll_count,
            result.messages.len(),
            result.aborted,
            result.time_elapsed_ms
        );
        result
    }
}
