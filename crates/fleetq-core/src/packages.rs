//! Package-based redeploy: collector builds published to S3 and the functions
//! that run them.

use aws_sdk_lambda as lambda;
use aws_sdk_s3 as s3;

use crate::error::ProviderError;
use crate::functions::{list_functions, POLL_COLLECTOR_DESCRIPTION, S3_COLLECTOR_DESCRIPTION};

pub const PACKAGE_BUCKET: &str = "rcs-alertlogic-collectors-us-east-1";
pub const PACKAGE_PREFIX: &str = "packages/lambda/";
/// Region holding both the package bucket and the collector functions.
pub const PACKAGE_REGION: &str = "us-east-1";
/// Profile used for the package bucket when the caller names none.
pub const DEFAULT_PACKAGE_PROFILE: &str = "playground";
/// Profile used for the collector functions when the caller names none.
pub const DEFAULT_FUNCTION_PROFILE: &str = "paws_integration";
/// Environment variable naming the package a function was deployed from.
pub const ZIPFILE_VARIABLE: &str = "aws_lambda_zipfile_name";

/// Where collector packages are published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageSource {
    pub bucket: String,
    pub prefix: String,
}

impl Default for PackageSource {
    fn default() -> Self {
        Self {
            bucket: PACKAGE_BUCKET.to_string(),
            prefix: PACKAGE_PREFIX.to_string(),
        }
    }
}

impl PackageSource {
    /// Whether `key` is `<prefix>al-<anything>.zip`.
    pub fn is_package_key(&self, key: &str) -> bool {
        key.strip_prefix(self.prefix.as_str())
            .and_then(|name| name.strip_prefix("al-"))
            .is_some_and(|rest| rest.ends_with(".zip"))
    }
}

/// Package keys under the source prefix, following pagination.
pub async fn list_packages(client: &s3::Client, source: &PackageSource) -> Result<Vec<String>, ProviderError> {
    let mut keys = Vec::new();
    let mut token = None;
    loop {
        let output = client
            .list_objects_v2()
            .bucket(&source.bucket)
            .prefix(&source.prefix)
            .set_continuation_token(token)
            .send()
            .await?;

        keys.extend(
            output
                .contents()
                .iter()
                .filter_map(|object| object.key())
                .filter(|key| source.is_package_key(key))
                .map(str::to_string),
        );

        token = output.next_continuation_token;
        if token.is_none() {
            break;
        }
    }

    log::debug!("found {} packages in s3://{}/{}", keys.len(), source.bucket, source.prefix);
    Ok(keys)
}

/// A collector function eligible for redeploy.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RedeployTarget {
    pub function_name: String,
    pub description: Option<String>,
    pub zipfile_name: Option<String>,
}

fn is_collector(description: Option<&str>) -> bool {
    description.is_some_and(|d| d.contains(POLL_COLLECTOR_DESCRIPTION) || d.contains(S3_COLLECTOR_DESCRIPTION))
}

/// Collector functions with the package name they were deployed from.
pub async fn list_redeploy_targets(client: &lambda::Client) -> Result<Vec<RedeployTarget>, ProviderError> {
    let targets = list_functions(client)
        .await?
        .into_iter()
        .filter(|f| is_collector(f.description.as_deref()))
        .map(|mut f| RedeployTarget {
            zipfile_name: f.environment.remove(ZIPFILE_VARIABLE),
            function_name: f.function_name,
            description: f.description,
        })
        .collect();
    Ok(targets)
}

/// The package whose file name is the target's recorded zip file.
pub fn match_package<'a>(target: &RedeployTarget, packages: &'a [String]) -> Option<&'a str> {
    let wanted = target.zipfile_name.as_deref()?;
    packages
        .iter()
        .map(String::as_str)
        .find(|key| key.rsplit('/').next() == Some(wanted))
}

/// One function of a redeploy run and the package it would be pointed at.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RedeployStep {
    pub function_name: String,
    pub package: Option<String>,
}

/// Matches every target (or only `function_name`) against the listed packages.
pub fn plan_redeploys(
    targets: &[RedeployTarget],
    packages: &[String],
    function_name: Option<&str>,
) -> Vec<RedeployStep> {
    targets
        .iter()
        .filter(|t| function_name.is_none_or(|name| t.function_name == name))
        .map(|t| RedeployStep {
            function_name: t.function_name.clone(),
            package: match_package(t, packages).map(str::to_string),
        })
        .collect()
}

/// Points the function at a package and publishes a new version.
pub async fn redeploy(
    client: &lambda::Client,
    function_name: &str,
    source: &PackageSource,
    key: &str,
) -> Result<String, ProviderError> {
    let output = client
        .update_function_code()
        .function_name(function_name)
        .s3_bucket(&source.bucket)
        .s3_key(key)
        .publish(true)
        .send()
        .await?;

    log::info!(
        "redeployed {function_name} from {key} (version {})",
        output.version().unwrap_or("?")
    );
    Ok(format!("Update command executed for {function_name} with {key}"))
}
