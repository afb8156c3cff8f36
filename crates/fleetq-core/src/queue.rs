//! SQS access: the queue service seam used by the drain engine, the message
//! model handed back to callers, and queue inventory helpers.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_sqs as sqs;
use sqs::types::{MessageSystemAttributeName, QueueAttributeName};

use crate::error::{FleetError, ProviderError};
use crate::status::QueueStatusSnapshot;

/// Parameters of one receive call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveRequest {
    /// Upper bound on messages returned by one call (SQS allows 1..=10).
    pub max_messages: i32,
    /// Server-side long-poll wait; zero returns immediately.
    pub wait_time: Duration,
    /// How long received messages stay hidden from other consumers.
    pub visibility_timeout: Duration,
}

/// The operations the drain engine needs from a queue service.
#[async_trait]
pub trait QueueService: Send + Sync {
    /// Approximate visible and in-flight counts for the queue.
    async fn fetch_status(&self, queue_url: &str) -> Result<QueueStatusSnapshot, ProviderError>;

    /// Receives one batch. Messages are left on the queue.
    async fn receive(
        &self,
        queue_url: &str,
        request: &ReceiveRequest,
    ) -> Result<Vec<Message>, ProviderError>;
}

#[async_trait]
impl<T: QueueService + ?Sized> QueueService for Arc<T> {
    async fn fetch_status(&self, queue_url: &str) -> Result<QueueStatusSnapshot, ProviderError> {
        (**self).fetch_status(queue_url).await
    }

    async fn receive(
        &self,
        queue_url: &str,
        request: &ReceiveRequest,
    ) -> Result<Vec<Message>, ProviderError> {
        (**self).receive(queue_url, request).await
    }
}

fn parse_count(
    attributes: Option<&std::collections::HashMap<QueueAttributeName, String>>,
    name: QueueAttributeName,
) -> u64 {
    attributes
        .and_then(|a| a.get(&name))
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

#[async_trait]
impl QueueService for sqs::Client {
    async fn fetch_status(&self, queue_url: &str) -> Result<QueueStatusSnapshot, ProviderError> {
        let output = self
            .get_queue_attributes()
            .queue_url(queue_url)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessages)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessagesNotVisible)
            .send()
            .await?;

        let attributes = output.attributes();
        Ok(QueueStatusSnapshot::new(
            parse_count(attributes, QueueAttributeName::ApproximateNumberOfMessages),
            parse_count(
                attributes,
                QueueAttributeName::ApproximateNumberOfMessagesNotVisible,
            ),
        ))
    }

    async fn receive(
        &self,
        queue_url: &str,
        request: &ReceiveRequest,
    ) -> Result<Vec<Message>, ProviderError> {
        let output = self
            .receive_message()
            .queue_url(queue_url)
            .max_number_of_messages(request.max_messages)
            .wait_time_seconds(request.wait_time.as_secs() as i32)
            .visibility_timeout(request.visibility_timeout.as_secs() as i32)
            .message_attribute_names("All")
            .message_system_attribute_names(MessageSystemAttributeName::All)
            .send()
            .await?;

        Ok(output
            .messages
            .unwrap_or_default()
            .into_iter()
            .map(Message::from)
            .collect())
    }
}

/// Serializable representation of a received SQS message.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Identifier assigned by SQS.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub body: String,
    /// Custom message attributes, by string value.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    /// System attributes such as `SentTimestamp` and `ApproximateReceiveCount`.
    #[serde(default)]
    pub system_attributes: BTreeMap<String, String>,
}

impl Message {
    /// The message id, if present and non-empty.
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref().filter(|id| !id.is_empty())
    }
}

impl From<sqs::types::Message> for Message {
    fn from(message: sqs::types::Message) -> Self {
        let attributes = message
            .message_attributes
            .unwrap_or_default()
            .into_iter()
            .map(|(name, value)| {
                // binary attributes have no string form; show their declared type
                let text = value
                    .string_value()
                    .map(str::to_string)
                    .unwrap_or_else(|| value.data_type().to_string());
                (name, text)
            })
            .collect();

        let system_attributes = message
            .attributes
            .unwrap_or_default()
            .into_iter()
            .map(|(name, value)| (name.as_str().to_string(), value))
            .collect();

        Self {
            id: message.message_id,
            body: message.body.unwrap_or_default(),
            attributes,
            system_attributes,
        }
    }
}

/// Insertion-ordered message collection that keeps the first message seen for
/// each non-empty id. Messages without an id are always kept.
#[derive(Debug, Clone, Default)]
pub struct MessageSet {
    messages: Vec<Message>,
    seen: HashSet<String>,
}

impl MessageSet {
    /// Adds the message unless its id was already seen. Returns whether it was added.
    pub fn insert(&mut self, message: Message) -> bool {
        if let Some(id) = message.id() {
            if !self.seen.insert(id.to_string()) {
                return false;
            }
        }
        self.messages.push(message);
        true
    }

    /// Adds every message, returning how many were new.
    pub fn extend(&mut self, messages: impl IntoIterator<Item = Message>) -> usize {
        messages
            .into_iter()
            .map(|m| self.insert(m))
            .filter(|added| *added)
            .count()
    }

    pub fn into_vec(self) -> Vec<Message> {
        self.messages
    }
}

impl FromIterator<Message> for MessageSet {
    fn from_iter<I: IntoIterator<Item = Message>>(iter: I) -> Self {
        let mut set = Self::default();
        set.extend(iter);
        set
    }
}

/// Lists all SQS queue URLs in the account and region.
///
/// Handles pagination, returning all queues regardless of count.
pub async fn list_queues(client: &sqs::Client) -> Result<Vec<String>, ProviderError> {
    let mut queues = Vec::new();

    let mut output = client.list_queues().send().await?;
    loop {
        if let Some(mut list) = output.queue_urls {
            queues.append(&mut list);
        }

        let Some(token) = output.next_token else {
            break;
        };

        output = client
            .list_queues()
            .set_next_token(Some(token))
            .send()
            .await?;
    }

    Ok(queues)
}

/// Builds a queue URL from an SQS queue ARN.
///
/// `arn:aws:sqs:us-east-1:123456789012:orders` becomes
/// `https://sqs.us-east-1.amazonaws.com/123456789012/orders`.
pub fn queue_url_from_arn(region: &str, arn: &str) -> Result<String, FleetError> {
    let parts: Vec<&str> = arn.split(':').collect();
    match parts.as_slice() {
        ["arn", _, "sqs", _, account, name] if !account.is_empty() && !name.is_empty() => Ok(
            format!("https://sqs.{region}.amazonaws.com/{account}/{name}"),
        ),
        _ => Err(FleetError::InvalidArn(arn.to_string())),
    }
}

/// URL and full attribute set of the queue behind an ARN.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueDetails {
    pub url: String,
    pub attributes: BTreeMap<String, String>,
}

pub async fn queue_details(
    client: &sqs::Client,
    region: &str,
    arn: &str,
) -> Result<QueueDetails, FleetError> {
    let url = queue_url_from_arn(region, arn)?;
    let output = client
        .get_queue_attributes()
        .queue_url(&url)
        .attribute_names(QueueAttributeName::All)
        .send()
        .await
        .map_err(ProviderError::from)?;

    let attributes = output
        .attributes
        .unwrap_or_default()
        .into_iter()
        .map(|(name, value)| (name.as_str().to_string(), value))
        .collect();

    Ok(QueueDetails { url, attributes })
}
