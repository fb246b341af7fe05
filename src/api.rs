//! Read-only HTTP status API over the daemon's job registry.

use crate::daemon::AppState;
use crate::error::{ApiError, ApiResponse};
use crate::snapper::SnapperReport;
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use std::sync::Arc;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/jobs/:name", get(job_status))
        .with_state(state)
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "zsnapd",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "job_count": state.jobs.len(),
    }))
}

async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut reports: Vec<SnapperReport> =
        state.jobs.iter().map(|entry| entry.value().report()).collect();
    reports.sort_by(|a, b| a.job.cmp(&b.job));
    Json(ApiResponse::ok(reports))
}

async fn job_status(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let snapper = state
        .jobs
        .get(&name)
        .ok_or_else(|| ApiError::NotFound(format!("job not found: {name}")))?;
    Ok(Json(ApiResponse::ok(snapper.report())))
}
