//! Diagnostics HTTP server
//!
//! Read-only operator endpoints: liveness, queue depth, scheduler counters
//! and per-config delivery history. Nothing here mutates delivery state.

use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use qahub_core::ConfigId;
use qahub_webhook::{ConfigSummary, WebhookError, MAX_HISTORY_LIMIT};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::app::AppState;

pub struct Server {
    address: String,
    state: AppState,
}

impl Server {
    pub fn new(address: String, state: AppState) -> Self {
        Self { address, state }
    }

    /// Serve until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(&self.address)
            .await
            .with_context(|| format!("Failed to bind diagnostics server to {}", self.address))?;

        info!("Diagnostics server listening on {}", self.address);

        axum::serve(listener, router(self.state).into_make_service())
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
            .context("Diagnostics server error")?;

        Ok(())
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/diagnostics/backlog", get(backlog))
        .route("/diagnostics/scheduler", get(scheduler_stats))
        .route("/diagnostics/configs", get(active_configs))
        .route("/diagnostics/configs/:id/deliveries", get(recent_deliveries))
        .route("/diagnostics/configs/:id/failed-count", get(failed_count))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Store failures surface as 503 so load balancers can tell them apart
pub struct ApiError(WebhookError);

impl From<WebhookError> for ApiError {
    fn from(err: WebhookError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = if self.0.is_store_failure() {
            StatusCode::SERVICE_UNAVAILABLE
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        error!(error = %self.0, "Diagnostics request failed");
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

// Route handlers

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({
        "service": "qahub-webhookd",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running"
    }))
}

async fn backlog(State(state): State<AppState>) -> ApiResult<serde_json::Value> {
    let backlog = state.diagnostics.backlog().await?;
    Ok(Json(json!({
        "pending": backlog.pending,
        "retrying": backlog.retrying,
        "delivering": backlog.delivering,
        "total": backlog.total(),
    })))
}

async fn scheduler_stats(State(state): State<AppState>) -> Json<qahub_webhook::SchedulerStats> {
    Json(state.scheduler.stats())
}

async fn active_configs(State(state): State<AppState>) -> ApiResult<Vec<ConfigSummary>> {
    let configs = state.configs.list_active().await?;
    Ok(Json(configs.into_iter().map(ConfigSummary::from).collect()))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    limit: Option<usize>,
}

async fn recent_deliveries(
    State(state): State<AppState>,
    Path(id): Path<ConfigId>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Vec<qahub_webhook::DeliverySummary>> {
    let limit = query.limit.unwrap_or(20).min(MAX_HISTORY_LIMIT);
    Ok(Json(state.diagnostics.recent_history(id, limit).await?))
}

async fn failed_count(
    State(state): State<AppState>,
    Path(id): Path<ConfigId>,
) -> ApiResult<serde_json::Value> {
    let failed = state.diagnostics.failed_count(id).await?;
    Ok(Json(json!({ "config_id": id, "failed": failed })))
}
