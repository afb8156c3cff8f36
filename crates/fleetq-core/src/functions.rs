//! Function inventory and configuration: thin wrappers over the Lambda API.

use std::collections::{BTreeMap, HashMap};

use aws_sdk_lambda as lambda;
use lambda::primitives::Blob;
use lambda::types::{Environment, FunctionConfiguration, InvocationType};

use crate::error::{FleetError, ProviderError};
use crate::queue::{queue_details, QueueDetails};

/// Description carried by S3 collector functions.
pub const S3_COLLECTOR_DESCRIPTION: &str = "Alert Logic S3 collector";
/// Description carried by poll-based collector functions.
pub const POLL_COLLECTOR_DESCRIPTION: &str = "Alert Logic Poll based collector";
/// Environment variable naming a poll collector's type.
pub const COLLECTOR_TYPE_VARIABLE: &str = "paws_type_name";
/// Environment variable holding the URL of a collector's state queue.
pub const STATE_QUEUE_VARIABLE: &str = "paws_state_queue_url";

/// Classifies a function for the dashboard's collector column.
pub fn collector_type(description: Option<&str>, environment: &BTreeMap<String, String>) -> String {
    if description == Some(S3_COLLECTOR_DESCRIPTION) {
        return "s3-collector".to_string();
    }
    environment
        .get(COLLECTOR_TYPE_VARIABLE)
        .cloned()
        .unwrap_or_else(|| "-".to_string())
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionSummary {
    pub function_name: String,
    pub function_arn: Option<String>,
    pub description: Option<String>,
    pub runtime: Option<String>,
    pub handler: Option<String>,
    pub memory_size: Option<i32>,
    pub timeout: Option<i32>,
    pub code_size: i64,
    pub last_modified: Option<String>,
    pub package_type: Option<String>,
    pub architectures: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub collector_type: String,
}

impl FunctionSummary {
    pub fn state_queue_url(&self) -> Option<&str> {
        self.environment
            .get(STATE_QUEUE_VARIABLE)
            .map(String::as_str)
            .filter(|url| !url.is_empty())
    }
}

impl From<&FunctionConfiguration> for FunctionSummary {
    fn from(config: &FunctionConfiguration) -> Self {
        let environment: BTreeMap<String, String> = config
            .environment()
            .and_then(|env| env.variables())
            .map(|vars| vars.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        let description = config.description().map(str::to_string);

        Self {
            function_name: config.function_name().unwrap_or_default().to_string(),
            function_arn: config.function_arn().map(str::to_string),
            runtime: config.runtime().map(|r| r.as_str().to_string()),
            handler: config.handler().map(str::to_string),
            memory_size: config.memory_size(),
            timeout: config.timeout(),
            code_size: config.code_size(),
            last_modified: config.last_modified().map(str::to_string),
            package_type: config.package_type().map(|p| p.as_str().to_string()),
            architectures: config
                .architectures()
                .iter()
                .map(|a| a.as_str().to_string())
                .collect(),
            collector_type: collector_type(description.as_deref(), &environment),
            description,
            environment,
        }
    }
}

/// Lists every function in the region, following pagination.
pub async fn list_functions(client: &lambda::Client) -> Result<Vec<FunctionSummary>, ProviderError> {
    let mut functions = Vec::new();
    let mut marker = None;
    loop {
        let output = client.list_functions().set_marker(marker).send().await?;
        functions.extend(output.functions().iter().map(FunctionSummary::from));

        marker = output.next_marker;
        if marker.is_none() {
            break;
        }
    }

    log::debug!("listed {} functions", functions.len());
    Ok(functions)
}

/// Number of functions per collector type.
pub fn collector_summary(functions: &[FunctionSummary]) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for function in functions {
        *counts.entry(function.collector_type.clone()).or_insert(0) += 1;
    }
    counts
}

/// An SQS queue feeding a function through an event source mapping.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MappedQueue {
    #[serde(flatten)]
    pub queue: QueueDetails,
    pub uuid: Option<String>,
    pub state: Option<String>,
    pub enabled: bool,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionDetails {
    pub config: FunctionSummary,
    pub queues: Vec<MappedQueue>,
}

/// Configuration of one function plus the SQS queues mapped to it.
///
/// A mapping whose queue cannot be described is logged and left out.
pub async fn function_details(
    client: &lambda::Client,
    sqs: &aws_sdk_sqs::Client,
    region: &str,
    function_name: &str,
) -> Result<FunctionDetails, FleetError> {
    let output = client
        .get_function()
        .function_name(function_name)
        .send()
        .await
        .map_err(ProviderError::from)?;
    let config = output
        .configuration()
        .map(FunctionSummary::from)
        .ok_or_else(|| FleetError::MissingConfiguration(function_name.to_string()))?;

    let mappings = client
        .list_event_source_mappings()
        .function_name(function_name)
        .send()
        .await
        .map_err(ProviderError::from)?;

    let mut queues = Vec::new();
    for mapping in mappings.event_source_mappings() {
        let Some(arn) = mapping.event_source_arn().filter(|arn| arn.contains(":sqs:")) else {
            continue;
        };

        match queue_details(sqs, region, arn).await {
            Ok(queue) => queues.push(MappedQueue {
                queue,
                uuid: mapping.uuid().map(str::to_string),
                state: mapping.state().map(str::to_string),
                enabled: mapping.state() == Some("Enabled"),
            }),
            Err(e) => log::error!("failed to fetch queue details for {arn}: {e}"),
        }
    }

    Ok(FunctionDetails { config, queues })
}

/// Enables or disables an event source mapping, returning its new state.
pub async fn toggle_event_source(
    client: &lambda::Client,
    uuid: &str,
    enable: bool,
) -> Result<Option<String>, ProviderError> {
    let output = client
        .update_event_source_mapping()
        .uuid(uuid)
        .enabled(enable)
        .send()
        .await?;

    log::info!("event source mapping {uuid} set enabled={enable}");
    Ok(output.state().map(str::to_string))
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationUpdate {
    pub function_name: Option<String>,
    pub last_update_status: Option<String>,
}

/// Replaces the function's environment variables.
pub async fn update_environment(
    client: &lambda::Client,
    function_name: &str,
    variables: HashMap<String, String>,
) -> Result<ConfigurationUpdate, ProviderError> {
    let output = client
        .update_function_configuration()
        .function_name(function_name)
        .environment(Environment::builder().set_variables(Some(variables)).build())
        .send()
        .await?;

    log::info!("updated environment of {function_name}");
    Ok(ConfigurationUpdate {
        function_name: output.function_name().map(str::to_string),
        last_update_status: output.last_update_status().map(|s| s.as_str().to_string()),
    })
}

#[derive(serde::Serialize)]
#[serde(rename_all = "PascalCase")]
struct SelfUpdateEvent<'a> {
    request_type: &'a str,
    #[serde(rename = "Type")]
    kind: &'a str,
}

fn self_update_payload() -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&SelfUpdateEvent {
        request_type: "ScheduledEvent",
        kind: "SelfUpdate",
    })
}

/// Fires an asynchronous self-update invocation; returns the invoke status code.
pub async fn trigger_self_update(client: &lambda::Client, function_name: &str) -> Result<i32, FleetError> {
    let output = client
        .invoke()
        .function_name(function_name)
        .invocation_type(InvocationType::Event)
        .payload(Blob::new(self_update_payload()?))
        .send()
        .await
        .map_err(ProviderError::from)?;

    log::info!("self-update triggered for {function_name}");
    Ok(output.status_code())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lambda::types::{Architecture, EnvironmentResponse, Runtime};

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn s3_collectors_are_recognised_by_description() {
        let vars = env(&[(COLLECTOR_TYPE_VARIABLE, "o365")]);
        assert_eq!(collector_type(Some(S3_COLLECTOR_DESCRIPTION), &vars), "s3-collector");
    }

    #[test]
    fn poll_collectors_use_their_type_variable() {
        let vars = env(&[(COLLECTOR_TYPE_VARIABLE, "o365")]);
        assert_eq!(collector_type(Some(POLL_COLLECTOR_DESCRIPTION), &vars), "o365");
        assert_eq!(collector_type(None, &BTreeMap::new()), "-");
    }

    #[test]
    fn summary_from_configuration() {
        let config = FunctionConfiguration::builder()
            .function_name("collector-o365")
            .description(POLL_COLLECTOR_DESCRIPTION)
            .runtime(Runtime::Nodejs20x)
            .memory_size(256)
            .code_size(1024)
            .architectures(Architecture::Arm64)
            .environment(
                EnvironmentResponse::builder()
                    .variables(COLLECTOR_TYPE_VARIABLE, "o365")
                    .variables(STATE_QUEUE_VARIABLE, "https://sqs.us-east-1.amazonaws.com/1/state")
                    .build(),
            )
            .build();

        let summary = FunctionSummary::from(&config);
        assert_eq!(summary.function_name, "collector-o365");
        assert_eq!(summary.runtime.as_deref(), Some("nodejs20.x"));
        assert_eq!(summary.architectures, ["arm64"]);
        assert_eq!(summary.collector_type, "o365");
        assert_eq!(summary.code_size, 1024);
        assert_eq!(
            summary.state_queue_url(),
            Some("https://sqs.us-east-1.amazonaws.com/1/state")
        );
    }

    #[test]
    fn counts_collector_types() {
        let function = |kind: &str| FunctionSummary {
            collector_type: kind.to_string(),
            ..FunctionSummary::default()
        };
        let counts = collector_summary(&[function("o365"), function("-"), function("o365")]);
        assert_eq!(counts.get("o365"), Some(&2));
        assert_eq!(counts.get("-"), Some(&1));
    }

    #[test]
    fn self_update_payload_shape() {
        let payload: serde_json::Value = serde_json::from_slice(&self_update_payload().unwrap()).unwrap();
        assert_eq!(
            payload,
            serde_json::json!({"RequestType": "ScheduledEvent", "Type": "SelfUpdate"})
        );
    }
}
