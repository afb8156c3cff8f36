use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::ProviderError;
use crate::queue::{Message, QueueService, ReceiveRequest};
use crate::status::QueueStatusSnapshot;

pub fn message(id: &str, body: &str) -> Message {
    Message {
        id: Some(id.to_string()),
        body: body.to_string(),
        ..Message::default()
    }
}

/// Messages whose ids and bodies are the given strings.
pub fn messages<const N: usize>(ids: [&str; N]) -> Vec<Message> {
    ids.iter().map(|id| message(id, id)).collect()
}

pub enum StatusStep {
    Ready(QueueStatusSnapshot),
    Fail(ProviderError),
    Hang,
}

pub enum ReceiveStep {
    /// Returns the messages at once.
    Messages(Vec<Message>),
    /// Waits out the requested server-side wait, then returns nothing.
    Empty,
    Fail(ProviderError),
    Hang,
}

/// In-memory queue that plays back scripted responses, one per call.
///
/// Once a script runs out, status calls report an empty queue and receives
/// behave like an empty SQS queue (or hang, see [`Self::hang_when_exhausted`]).
#[derive(Default)]
pub struct ScriptedQueue {
    status: Mutex<VecDeque<StatusStep>>,
    receives: Mutex<VecDeque<ReceiveStep>>,
    hang_when_exhausted: bool,
    status_calls: Mutex<usize>,
    waits: Mutex<Vec<Duration>>,
}

impl ScriptedQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(self, steps: impl IntoIterator<Item = StatusStep>) -> Self {
        self.status.lock().unwrap().extend(steps);
        self
    }

    pub fn with_receives(self, steps: impl IntoIterator<Item = ReceiveStep>) -> Self {
        self.receives.lock().unwrap().extend(steps);
        self
    }

    pub fn hang_when_exhausted(mut self) -> Self {
        self.hang_when_exhausted = true;
        self
    }

    pub fn status_calls(&self) -> usize {
        *self.status_calls.lock().unwrap()
    }

    pub fn receive_calls(&self) -> usize {
        self.waits.lock().unwrap().len()
    }

    /// Server-side wait requested by each receive call, in call order.
    pub fn received_waits(&self) -> Vec<Duration> {
        self.waits.lock().unwrap().clone()
    }
}

#[async_trait]
impl QueueService for ScriptedQueue {
    async fn fetch_status(&self, _queue_url: &str) -> Result<QueueStatusSnapshot, ProviderError> {
        *self.status_calls.lock().unwrap() += 1;
        let step = self.status.lock().unwrap().pop_front();
        match step {
            None => Ok(QueueStatusSnapshot::default()),
            Some(StatusStep::Ready(snapshot)) => Ok(snapshot),
            Some(StatusStep::Fail(err)) => Err(err),
            Some(StatusStep::Hang) => std::future::pending().await,
        }
    }

    async fn receive(
        &self,
        _queue_url: &str,
        request: &ReceiveRequest,
    ) -> Result<Vec<Message>, ProviderError> {
        self.waits.lock().unwrap().push(request.wait_time);
        let step = self.receives.lock().unwrap().pop_front();
        let step = match step {
            Some(step) => step,
            None if self.hang_when_exhausted => ReceiveStep::Hang,
            None => ReceiveStep::Empty,
        };

        match step {
            ReceiveStep::Messages(batch) => Ok(batch),
            ReceiveStep::Empty => {
                tokio::time::sleep(request.wait_time).await;
                Ok(Vec::new())
            }
            ReceiveStep::Fail(err) => Err(err),
            ReceiveStep::Hang => std::future::pending().await,
        }
    }
}
