//! Cached AWS clients keyed by credential profile and region.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use aws_config::retry::RetryConfig;
use aws_config::timeout::TimeoutConfig;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use dashmap::DashMap;
use tokio::sync::OnceCell;

pub const DEFAULT_REGION: &str = "us-east-1";

/// Connect timeout applied to every client.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
/// Socket read timeout applied to every client except the logs client.
pub const READ_TIMEOUT: Duration = Duration::from_secs(30);
/// Log queries scan a whole log group and get a longer read timeout.
pub const LOGS_READ_TIMEOUT: Duration = Duration::from_secs(60);
/// Transport-level attempts, including the first.
pub const MAX_ATTEMPTS: u32 = 2;

/// Transport settings shared by every client the provider builds.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub max_attempts: u32,
    /// Overrides the service endpoint, e.g. LocalStack.
    pub endpoint_url: Option<String>,
    /// Use static `test`/`test` credentials instead of the named profile.
    pub static_credentials: bool,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
            read_timeout: READ_TIMEOUT,
            max_attempts: MAX_ATTEMPTS,
            endpoint_url: None,
            static_credentials: false,
        }
    }
}

impl ClientSettings {
    /// Settings for a LocalStack-style endpoint with static credentials.
    pub fn local(endpoint_url: &str) -> Self {
        Self {
            endpoint_url: Some(endpoint_url.to_string()),
            static_credentials: true,
            ..Self::default()
        }
    }

    fn timeout_config(&self, read_timeout: Duration) -> TimeoutConfig {
        TimeoutConfig::builder()
            .connect_timeout(self.connect_timeout)
            .read_timeout(read_timeout)
            .build()
    }

    /// Loads an SDK config for the given profile and region.
    ///
    /// Credentials are resolved lazily by the SDK, so a bad profile or region
    /// surfaces on the first call made with the resulting clients.
    pub async fn load(&self, profile: &str, region: &str) -> SdkConfig {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .timeout_config(self.timeout_config(self.read_timeout))
            .retry_config(RetryConfig::standard().with_max_attempts(self.max_attempts));

        loader = if self.static_credentials {
            loader.credentials_provider(aws_sdk_sqs::config::Credentials::new(
                "test", "test", None, None, "static",
            ))
        } else {
            loader.profile_name(profile)
        };

        if let Some(endpoint_url) = &self.endpoint_url {
            loader = loader.endpoint_url(endpoint_url);
        }

        loader.load().await
    }
}

/// Key used by every cache: `profile:region`.
pub fn cache_key(profile: &str, region: &str) -> String {
    format!("{profile}:{region}")
}

/// Process-lifetime cache of lazily constructed values keyed by profile and region.
///
/// Concurrent first calls for one key wait on the same cell, so exactly one
/// value is ever installed per key. Entries are never evicted.
pub struct ClientCache<C> {
    slots: DashMap<String, Arc<OnceCell<C>>>,
}

impl<C> Default for ClientCache<C> {
    fn default() -> Self {
        Self {
            slots: DashMap::new(),
        }
    }
}

impl<C: Clone> ClientCache<C> {
    pub async fn get_or_init<F, Fut>(&self, profile: &str, region: &str, init: F) -> C
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = C>,
    {
        // the map guard must not be held across the await below
        let cell = self
            .slots
            .entry(cache_key(profile, region))
            .or_default()
            .clone();

        cell.get_or_init(init).await.clone()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots.len()
    }
}

/// Hands out AWS clients for (profile, region) pairs, building each at most once.
#[derive(Default)]
pub struct ClientProvider {
    settings: ClientSettings,
    configs: ClientCache<SdkConfig>,
    sqs: ClientCache<aws_sdk_sqs::Client>,
    lambda: ClientCache<aws_sdk_lambda::Client>,
    logs: ClientCache<aws_sdk_cloudwatchlogs::Client>,
    s3: ClientCache<aws_sdk_s3::Client>,
}

impl ClientProvider {
    pub fn new(settings: ClientSettings) -> Self {
        Self {
            settings,
            ..Self::default()
        }
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub async fn sdk_config(&self, profile: &str, region: &str) -> SdkConfig {
        self.configs
            .get_or_init(profile, region, || {
                log::debug!("loading aws config for {}", cache_key(profile, region));
                self.settings.load(profile, region)
            })
            .await
    }

    pub async fn sqs(&self, profile: &str, region: &str) -> aws_sdk_sqs::Client {
        self.sqs
            .get_or_init(profile, region, || async {
                aws_sdk_sqs::Client::new(&self.sdk_config(profile, region).await)
            })
            .await
    }

    pub async fn lambda(&self, profile: &str, region: &str) -> aws_sdk_lambda::Client {
        self.lambda
            .get_or_init(profile, region, || async {
                aws_sdk_lambda::Client::new(&self.sdk_config(profile, region).await)
            })
            .await
    }

    pub async fn logs(&self, profile: &str, region: &str) -> aws_sdk_cloudwatchlogs::Client {
        self.logs
            .get_or_init(profile, region, || async {
                let config = self.sdk_config(profile, region).await;
                let conf = aws_sdk_cloudwatchlogs::config::Builder::from(&config)
                    .timeout_config(self.settings.timeout_config(LOGS_READ_TIMEOUT))
                    .build();
                aws_sdk_cloudwatchlogs::Client::from_conf(conf)
            })
            .await
    }

    pub async fn s3(&self, profile: &str, region: &str) -> aws_sdk_s3::Client {
        self.s3
            .get_or_init(profile, region, || async {
                let config = self.sdk_config(profile, region).await;
                // LocalStack serves buckets under the path, not a subdomain
                let conf = aws_sdk_s3::config::Builder::from(&config)
                    .force_path_style(self.settings.endpoint_url.is_some())
                    .build();
                aws_sdk_s3::Client::from_conf(conf)
            })
            .await
    }
}
