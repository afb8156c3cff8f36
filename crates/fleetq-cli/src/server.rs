//! `fleetq serve`: the JSON API behind the operations dashboard.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    routing::{delete, get, post},
    Router,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use fleetq::{ClientProvider, DrainSettings, ProgressWatch};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use crate::handlers;

/// A drain started through `POST /api/sqs-poll` that has not returned yet.
pub struct RunningDrain {
    pub cancel: CancellationToken,
    pub progress: ProgressWatch,
}

/// Shared state for axum request handlers.
#[derive(Clone)]
pub struct AppState {
    pub clients: Arc<ClientProvider>,
    pub settings: DrainSettings,
    /// In-flight drains by drain id.
    pub drains: Arc<DashMap<String, RunningDrain>>,
    /// Fired on server shutdown; every drain token is a child of it.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(clients: ClientProvider, settings: DrainSettings) -> Self {
        Self {
            clients: Arc::new(clients),
            settings,
            drains: Arc::new(DashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Records a drain under `drain_id`. Returns `None` if the id is taken.
    pub fn register(&self, drain_id: &str, progress: ProgressWatch) -> Option<Registration> {
        let cancel = self.shutdown.child_token();
        match self.drains.entry(drain_id.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(RunningDrain {
                    cancel: cancel.clone(),
                    progress,
                });
                Some(Registration {
                    drains: Arc::clone(&self.drains),
                    drain_id: drain_id.to_string(),
                    cancel,
                })
            }
        }
    }
}

/// Keeps a drain listed while its request is alive.
///
/// Dropping it (the handler returned, or the client went away and the
/// handler future was dropped) unlists the drain and fires its token.
pub struct Registration {
    drains: Arc<DashMap<String, RunningDrain>>,
    drain_id: String,
    cancel: CancellationToken,
}

impl Registration {
    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.drains.remove(&self.drain_id);
        self.cancel.cancel();
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/sqs-poll", post(handlers::post_sqs_poll))
        .route("/api/sqs-poll/{drain_id}", delete(handlers::delete_sqs_poll))
        .route("/api/sqs-poll/{drain_id}/progress", get(handlers::get_sqs_poll_progress))
        .route("/api/sqs-status", get(handlers::get_sqs_status))
        .route("/api/lambdas", get(handlers::get_lambdas).post(handlers::post_lambdas))
        .route("/api/collector-summary", get(handlers::get_collector_summary))
        .route("/api/aws-profiles", get(handlers::get_aws_profiles))
        .route(
            "/api/zip-update",
            get(handlers::get_zip_update).post(handlers::post_zip_update),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serves the API until Ctrl-C, cancelling in-flight drains on the way out.
pub async fn serve(state: AppState, host: &str, port: u16) -> anyhow::Result<()> {
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    log::info!("dashboard api listening on http://{addr}");

    let shutdown = state.shutdown.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::info!("shutting down, cancelling running drains");
            }
            shutdown.cancel();
        })
        .await
        .context("server error")?;

    Ok(())
}
