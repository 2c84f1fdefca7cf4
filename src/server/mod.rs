//! HTTP surface for on-demand backups and status.

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;

use crate::orchestrator::TriggerSource;
use crate::scheduler::{SchedulerStatus, TriggerHandle, TriggerOutcome};

#[derive(Debug, Serialize)]
struct TriggerResponse {
    status: TriggerOutcome,
}

pub fn router(handle: TriggerHandle) -> Router {
    Router::new()
        .route("/start_backup", post(start_backup))
        .route("/status", get(status))
        .route("/health", get(health))
        .with_state(handle)
}

/// Serves until `shutdown` is cancelled, then drains in-flight requests.
pub async fn serve(
    addr: SocketAddr,
    handle: TriggerHandle,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind HTTP listener on {}", addr))?;
    tracing::info!("Listening for backup triggers on http://{}", addr);

    axum::serve(listener, router(handle))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .context("HTTP server failed")
}

async fn start_backup(State(handle): State<TriggerHandle>) -> (StatusCode, Json<TriggerResponse>) {
    let outcome = handle.trigger(TriggerSource::OnDemand);
    let code = match outcome {
        TriggerOutcome::Started | TriggerOutcome::Coalesced => StatusCode::ACCEPTED,
        TriggerOutcome::Rejected => StatusCode::SERVICE_UNAVAILABLE,
    };
    (code, Json(TriggerResponse { status: outcome }))
}

async fn status(State(handle): State<TriggerHandle>) -> Json<SchedulerStatus> {
    Json(handle.status())
}

async fn health() -> &'static str {
    "ok"
}
