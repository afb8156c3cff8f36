//! Error types shared by the queue engine and the fleet operations.

use aws_sdk_sqs::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};

/// Error codes the providers use when a caller is being rate limited.
const THROTTLING_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "RequestThrottled",
    "TooManyRequestsException",
    "RequestLimitExceeded",
    "SlowDown",
];

pub fn is_throttling_code(code: &str) -> bool {
    THROTTLING_CODES.contains(&code)
}

/// A failed call against a cloud provider API.
///
/// Keeps the provider's error code and message apart so operator-facing
/// responses can show them verbatim.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct ProviderError {
    pub code: Option<String>,
    pub message: String,
}

impl ProviderError {
    pub fn service(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    /// True for throttling errors reported by the service.
    pub fn is_throttling(&self) -> bool {
        self.code.as_deref().is_some_and(is_throttling_code)
    }
}

// Every generated AWS client shares the smithy `SdkError`, so one conversion
// covers SQS, Lambda, CloudWatch Logs and S3.
impl<E, R> From<SdkError<E, R>> for ProviderError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    fn from(err: SdkError<E, R>) -> Self {
        let code = err.code().map(str::to_string);
        let message = match err.message() {
            Some(message) => message.to_string(),
            None => DisplayErrorContext(&err).to_string(),
        };

        Self { code, message }
    }
}

/// Errors from the function, log, package and queue inventory operations.
#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("not an SQS queue ARN: {0}")]
    InvalidArn(String),
    #[error("function {0} returned no configuration")]
    MissingConfiguration(String),
    #[error("failed to encode payload: {0}")]
    Payload(#[from] serde_json::Error),
}

impl FleetError {
    pub fn provider(&self) -> Option<&ProviderError> {
        match self {
            FleetError::Provider(err) => Some(err),
            _ => None,
        }
    }
}
