//! Recent CloudWatch log events of a function.

use std::time::Duration;

use aws_sdk_cloudwatchlogs as cloudwatchlogs;
use cloudwatchlogs::types::FilteredLogEvent;

use crate::error::ProviderError;

/// How far back [`recent_logs`] looks.
pub const LOG_WINDOW: Duration = Duration::from_secs(60 * 60);
/// Most events returned by one [`recent_logs`] call.
pub const LOG_LIMIT: i32 = 100;

pub fn log_group_for(function_name: &str) -> String {
    format!("/aws/lambda/{function_name}")
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEvent {
    pub timestamp: i64,
    pub message: String,
    pub log_stream_name: Option<String>,
}

impl From<&FilteredLogEvent> for LogEvent {
    fn from(event: &FilteredLogEvent) -> Self {
        Self {
            timestamp: event.timestamp().unwrap_or_default(),
            message: event.message().unwrap_or_default().to_string(),
            log_stream_name: event.log_stream_name().map(str::to_string),
        }
    }
}

/// Sorts newest first.
fn newest_first(mut events: Vec<LogEvent>) -> Vec<LogEvent> {
    events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    events
}

/// Events of the last hour from the function's log group, newest first.
pub async fn recent_logs(
    client: &cloudwatchlogs::Client,
    function_name: &str,
) -> Result<Vec<LogEvent>, ProviderError> {
    let end = chrono::Utc::now().timestamp_millis();
    let start = end - LOG_WINDOW.as_millis() as i64;

    let output = client
        .filter_log_events()
        .log_group_name(log_group_for(function_name))
        .start_time(start)
        .end_time(end)
        .limit(LOG_LIMIT)
        .send()
        .await?;

    let events = output.events().iter().map(LogEvent::from).collect();
    Ok(newest_first(events))
}
