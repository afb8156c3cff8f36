//! HTTP request handlers for the dashboard API.
//!
//! Every failure is answered as `{"error": "..."}`. Drain failures are the
//! exception: they carry the full diagnostic shape produced by the engine.

use std::collections::HashMap;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use fleetq::functions::{
    collector_summary, function_details, list_functions, toggle_event_source, trigger_self_update,
    update_environment,
};
use fleetq::logs::recent_logs;
use fleetq::packages::{
    list_packages, list_redeploy_targets, redeploy, PackageSource, DEFAULT_FUNCTION_PROFILE,
    DEFAULT_PACKAGE_PROFILE, PACKAGE_REGION,
};
use fleetq::profiles::{self, DEFAULT_PROFILE};
use fleetq::{
    list_queues, probe_status, DrainFailure, DrainRequest, Drainer, FleetError, ProbeError,
    ProgressReporter, ProviderError, DEFAULT_REGION,
};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// A handler failure with the status it should be answered with.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

// Throttled provider calls answer 429, everything else 500.
impl<E: Into<anyhow::Error>> From<E> for ApiError {
    fn from(err: E) -> Self {
        let err = err.into();
        let status = if is_throttled(&err) {
            log::warn!("request throttled: {err:#}");
            StatusCode::TOO_MANY_REQUESTS
        } else {
            log::error!("request failed: {err:#}");
            StatusCode::INTERNAL_SERVER_ERROR
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

fn is_throttled(err: &anyhow::Error) -> bool {
    err.downcast_ref::<ProviderError>()
        .or_else(|| err.downcast_ref::<FleetError>().and_then(FleetError::provider))
        .or_else(|| err.downcast_ref::<ProbeError>().and_then(ProbeError::provider))
        .is_some_and(ProviderError::is_throttling)
}

fn failure_status(failure: &DrainFailure) -> StatusCode {
    if failure.is_throttled() {
        StatusCode::TOO_MANY_REQUESTS
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorResponse { error: self.message })).into_response()
    }
}

/// Profile and region of a request, with the dashboard defaults applied.
#[derive(Debug, Default, Deserialize)]
pub struct Account {
    pub profile: Option<String>,
    pub region: Option<String>,
}

impl Account {
    fn profile(&self) -> &str {
        non_empty(self.profile.as_deref()).unwrap_or(DEFAULT_PROFILE)
    }

    fn region(&self) -> &str {
        non_empty(self.region.as_deref()).unwrap_or(DEFAULT_REGION)
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

/// Request body for POST /api/sqs-poll.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollRequest {
    #[serde(flatten)]
    pub account: Account,
    #[serde(alias = "queueId")]
    pub queue_url: Option<String>,
    /// Lets the caller follow progress and cancel by id.
    pub drain_id: Option<String>,
}

/// POST /api/sqs-poll
///
/// Runs one drain for the lifetime of the request. If the client goes away
/// the handler future is dropped, which stops the drain.
pub async fn post_sqs_poll(
    State(state): State<AppState>,
    Json(body): Json<PollRequest>,
) -> Result<Response, ApiError> {
    let Some(queue_url) = non_empty(body.queue_url.as_deref()) else {
        return Err(ApiError::bad_request("Missing queueUrl"));
    };
    let request = DrainRequest {
        profile: body.account.profile().to_string(),
        region: body.account.region().to_string(),
        queue_url: queue_url.to_string(),
    };
    let drain_id = body
        .drain_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let (reporter, progress) = ProgressReporter::channel();
    let Some(registration) = state.register(&drain_id, progress) else {
        return Ok((
            StatusCode::CONFLICT,
            Json(ErrorResponse {
                error: format!("Drain {drain_id} is already running"),
            }),
        )
            .into_response());
    };

    log::info!("drain {drain_id} started for {}", request.queue_url);
    let sqs = state.clients.sqs(&request.profile, &request.region).await;
    let drainer = Drainer::with_settings(sqs, state.settings.clone());
    let outcome = drainer.drain(&request, registration.token(), reporter).await;
    drop(registration);

    Ok(match outcome {
        Ok(result) => Json(result).into_response(),
        Err(failure) => (failure_status(&failure), Json(failure)).into_response(),
    })
}

/// DELETE /api/sqs-poll/{drain_id}
pub async fn delete_sqs_poll(
    State(state): State<AppState>,
    Path(drain_id): Path<String>,
) -> Result<Response, ApiError> {
    let cancel = state
        .drains
        .get(&drain_id)
        .map(|drain| drain.cancel.clone())
        .ok_or_else(|| ApiError::not_found(format!("Unknown drain {drain_id}")))?;

    cancel.cancel();
    log::info!("drain {drain_id} cancelled by request");
    Ok((StatusCode::ACCEPTED, Json(json!({ "drainId": drain_id }))).into_response())
}

/// GET /api/sqs-poll/{drain_id}/progress
///
/// One `progress` event now and one per update after that; the stream ends
/// with the drain.
pub async fn get_sqs_poll_progress(
    State(state): State<AppState>,
    Path(drain_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    let progress = state
        .drains
        .get(&drain_id)
        .map(|drain| drain.progress.clone())
        .ok_or_else(|| ApiError::not_found(format!("Unknown drain {drain_id}")))?;

    let events = stream::unfold((progress, true), |(mut rx, first)| async move {
        if !first && rx.changed().await.is_err() {
            return None;
        }
        let snapshot = *rx.borrow_and_update();
        Some((Event::default().event("progress").json_data(snapshot), (rx, false)))
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusQuery {
    #[serde(flatten)]
    pub account: Account,
    #[serde(alias = "queueId")]
    pub queue_url: Option<String>,
}

/// GET /api/sqs-status
pub async fn get_sqs_status(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> Result<Response, ApiError> {
    let Some(queue_url) = non_empty(query.queue_url.as_deref()) else {
        return Err(ApiError::bad_request("Missing queueUrl"));
    };

    let sqs = state
        .clients
        .sqs(query.account.profile(), query.account.region())
        .await;
    let snapshot = probe_status(&sqs, queue_url, &state.settings.probe).await?;
    Ok(Json(snapshot).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LambdasQuery {
    #[serde(flatten)]
    pub account: Account,
    pub function_name: Option<String>,
    pub logs: Option<String>,
}

/// GET /api/lambdas
///
/// Without `functionName`: every function plus every queue URL. With it:
/// that function's configuration and mapped queues, or its recent logs
/// when `logs=1`.
pub async fn get_lambdas(
    State(state): State<AppState>,
    Query(query): Query<LambdasQuery>,
) -> Result<Response, ApiError> {
    let (profile, region) = (query.account.profile(), query.account.region());

    if let Some(name) = non_empty(query.function_name.as_deref()) {
        if query.logs.as_deref() == Some("1") {
            log::info!("fetching logs of {name} ({profile}/{region})");
            let logs = recent_logs(&state.clients.logs(profile, region).await, name).await?;
            return Ok(Json(json!({ "logs": logs })).into_response());
        }

        log::info!("fetching configuration of {name} ({profile}/{region})");
        let lambda = state.clients.lambda(profile, region).await;
        let sqs = state.clients.sqs(profile, region).await;
        let details = function_details(&lambda, &sqs, region, name).await?;
        return Ok(Json(details).into_response());
    }

    log::info!("listing functions and queues ({profile}/{region})");
    let lambda = state.clients.lambda(profile, region).await;
    let sqs = state.clients.sqs(profile, region).await;
    let (lambdas, queues) = tokio::try_join!(list_functions(&lambda), list_queues(&sqs))?;
    Ok(Json(json!({ "lambdas": lambdas, "sqsQueues": queues })).into_response())
}

/// Request body for POST /api/lambdas.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LambdaUpdate {
    #[serde(flatten)]
    pub account: Account,
    pub uuid: Option<String>,
    pub enable: Option<bool>,
    pub function_name: Option<String>,
    pub env_vars: Option<HashMap<String, String>>,
    pub self_update: Option<bool>,
}

/// POST /api/lambdas
///
/// Toggles an event source mapping (`uuid` + `enable`), triggers a
/// self-update, or replaces environment variables, in that order of precedence.
pub async fn post_lambdas(
    State(state): State<AppState>,
    Json(body): Json<LambdaUpdate>,
) -> Result<Response, ApiError> {
    let (profile, region) = (body.account.profile(), body.account.region());

    if let Some(uuid) = non_empty(body.uuid.as_deref()) {
        let enable = body.enable.unwrap_or(false);
        let lambda = state.clients.lambda(profile, region).await;
        let mapping_state = toggle_event_source(&lambda, uuid, enable).await?;
        return Ok(Json(json!({ "uuid": uuid, "state": mapping_state })).into_response());
    }

    let function_name = non_empty(body.function_name.as_deref());
    match (function_name, body.self_update, body.env_vars) {
        (Some(name), Some(true), _) => {
            let lambda = state.clients.lambda(profile, region).await;
            let result = trigger_self_update(&lambda, name).await?;
            Ok(Json(json!({ "status": "SelfUpdate triggered", "result": result })).into_response())
        }
        (Some(name), _, Some(vars)) => {
            let lambda = state.clients.lambda(profile, region).await;
            let updated = update_environment(&lambda, name, vars).await?;
            Ok(Json(updated).into_response())
        }
        _ => Err(ApiError::bad_request(
            "Invalid request. Must provide either selfUpdate or envVars with functionName.",
        )),
    }
}

/// GET /api/collector-summary
pub async fn get_collector_summary(
    State(state): State<AppState>,
    Query(account): Query<Account>,
) -> Result<Response, ApiError> {
    let lambda = state.clients.lambda(account.profile(), account.region()).await;
    let functions = list_functions(&lambda).await?;
    Ok(Json(json!({ "collectorCounts": collector_summary(&functions) })).into_response())
}

/// GET /api/aws-profiles
pub async fn get_aws_profiles() -> Json<Vec<String>> {
    Json(profiles::discover())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZipQuery {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    #[serde(rename = "profileS3")]
    pub profile_s3: Option<String>,
    pub profile_lambda: Option<String>,
}

/// GET /api/zip-update?type=zipfiles|lambdas
pub async fn get_zip_update(
    State(state): State<AppState>,
    Query(query): Query<ZipQuery>,
) -> Result<Response, ApiError> {
    match query.kind.as_deref() {
        Some("zipfiles") => {
            let profile = non_empty(query.profile_s3.as_deref()).unwrap_or(DEFAULT_PACKAGE_PROFILE);
            let s3 = state.clients.s3(profile, PACKAGE_REGION).await;
            let zip_files = list_packages(&s3, &PackageSource::default()).await?;
            Ok(Json(json!({ "zipFiles": zip_files })).into_response())
        }
        Some("lambdas") => {
            let profile =
                non_empty(query.profile_lambda.as_deref()).unwrap_or(DEFAULT_FUNCTION_PROFILE);
            let lambda = state.clients.lambda(profile, PACKAGE_REGION).await;
            let functions = list_redeploy_targets(&lambda).await?;
            Ok(Json(json!({ "functions": functions })).into_response())
        }
        _ => Err(ApiError::bad_request("Invalid request")),
    }
}

/// Request body for POST /api/zip-update.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZipUpdate {
    pub function_name: Option<String>,
    pub zip_file: Option<String>,
    pub profile_lambda: Option<String>,
}

/// POST /api/zip-update
pub async fn post_zip_update(
    State(state): State<AppState>,
    Json(body): Json<ZipUpdate>,
) -> Result<Response, ApiError> {
    let (Some(function_name), Some(zip_file)) = (
        non_empty(body.function_name.as_deref()),
        non_empty(body.zip_file.as_deref()),
    ) else {
        return Err(ApiError::bad_request("Missing functionName or zipFile"));
    };

    let profile = non_empty(body.profile_lambda.as_deref()).unwrap_or(DEFAULT_FUNCTION_PROFILE);
    let lambda = state.clients.lambda(profile, PACKAGE_REGION).await;
    let status = redeploy(&lambda, function_name, &PackageSource::default(), zip_file).await?;
    Ok(Json(json!({ "status": status })).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{router, AppState};
    use axum::body::Body;
    use axum::http::{Method, Request};
    use fleetq::{ClientProvider, ClientSettings, DrainSettings, ProbePolicy};
    use std::time::Duration;
    use tower::ServiceExt;

    fn state() -> AppState {
        // nothing listens on port 9, so every provider call fails fast
        let clients = ClientProvider::new(ClientSettings::local("http://127.0.0.1:9"));
        let settings = DrainSettings {
            probe: ProbePolicy {
                retry_interval: Duration::from_millis(10),
                ..ProbePolicy::default()
            },
            ..DrainSettings::default()
        };
        AppState::new(clients, settings)
    }

    fn json_request(method: Method, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn poll_without_queue_url_is_rejected() {
        let response = router(state())
            .oneshot(json_request(Method::POST, "/api/sqs-poll", json!({ "profile": "dev" })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await, json!({ "error": "Missing queueUrl" }));
    }

    #[tokio::test]
    async fn poll_with_empty_queue_url_is_rejected() {
        let response = router(state())
            .oneshot(json_request(Method::POST, "/api/sqs-poll", json!({ "queueUrl": "" })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unreachable_queue_answers_with_failure_shape() {
        let state = state();
        let response = router(state.clone())
            .oneshot(json_request(
                Method::POST,
                "/api/sqs-poll",
                json!({ "queueId": "http://127.0.0.1:9/000000000000/q", "drainId": "d-1" }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["strategy"], "status-check");
        assert_eq!(body["profile"], "default");
        assert_eq!(body["region"], "us-east-1");
        assert_eq!(body["queueId"], "http://127.0.0.1:9/000000000000/q");
        assert!(body["error"].as_str().unwrap().starts_with("queue status check failed"));
        assert!(state.drains.is_empty());
    }

    #[tokio::test]
    async fn unknown_drains_are_not_found() {
        let app = router(state());

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(Method::DELETE)
                    .uri("/api/sqs-poll/nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/sqs-poll/nope/progress")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn delete_fires_the_drain_token() {
        let state = state();
        let (_reporter, progress) = ProgressReporter::channel();
        let registration = state.register("d-2", progress).unwrap();

        let response = router(state.clone())
            .oneshot(
                Request::builder()
                    .method(Method::DELETE)
                    .uri("/api/sqs-poll/d-2")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert!(registration.token().is_cancelled());
    }

    #[tokio::test]
    async fn progress_streams_until_the_drain_ends() {
        let state = state();
        let (reporter, progress) = ProgressReporter::channel();
        let registration = state.register("d-3", progress).unwrap();

        let response = router(state.clone())
            .oneshot(
                Request::builder()
                    .uri("/api/sqs-poll/d-3/progress")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        drop(reporter);
        drop(registration);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("event: progress"));
        assert!(text.contains(r#""strategy":"status-check""#));
    }

    #[tokio::test]
    async fn lambda_update_needs_an_action() {
        let response = router(state())
            .oneshot(json_request(
                Method::POST,
                "/api/lambdas",
                json!({ "functionName": "collector" }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().starts_with("Invalid request"));
    }

    #[tokio::test]
    async fn zip_update_validates_input() {
        let app = router(state());

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/zip-update?type=other")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(json_request(
                Method::POST,
                "/api/zip-update",
                json!({ "functionName": "collector" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn profiles_always_include_default() {
        let response = router(state())
            .oneshot(
                Request::builder()
                    .uri("/api/aws-profiles")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let profiles = body_json(response).await;
        assert!(profiles.as_array().unwrap().iter().any(|p| p == "default"));
    }

    #[tokio::test]
    async fn throttled_provider_errors_answer_too_many_requests() {
        let throttled = || ProviderError::service("ThrottlingException", "Rate exceeded");

        let response = ApiError::from(throttled()).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body_json(response).await, json!({ "error": "Rate exceeded" }));

        let status = |err: ApiError| err.into_response().status();
        assert_eq!(status(FleetError::from(throttled()).into()), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(status(ProbeError::from(throttled()).into()), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            status(ProviderError::service("AccessDenied", "no").into()),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn throttled_drain_failures_answer_too_many_requests() {
        let failure = |code: &str| -> DrainFailure {
            serde_json::from_value(json!({
                "error": "queue status check failed: Rate exceeded",
                "profile": "default",
                "region": "us-east-1",
                "queueId": "q",
                "time": "2026-10-16T10:00:00Z",
                "providerErrorCode": code,
                "strategy": "status-check",
            }))
            .unwrap()
        };

        assert_eq!(failure_status(&failure("Throttling")), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(failure_status(&failure("AccessDenied")), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
