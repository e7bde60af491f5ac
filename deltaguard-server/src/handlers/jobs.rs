use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use deltaguard_core::progress_log::LogCursor;
use deltaguard_core::types::{Job, JobId, NewJob, ProgressRecord};
use serde::Serialize;
use tracing::{info, warn};

use crate::errors::AppResult;
use crate::infra::app_state::AppState;

/// Most progress records returned by the list endpoint.
pub const PROGRESS_LIST_LIMIT: usize = 1000;

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub ok: bool,
    pub cancelled: bool,
}

#[derive(Debug, Serialize)]
pub struct OkResponse {
    pub ok: bool,
}

pub async fn get_job_handler(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> AppResult<Json<Job>> {
    Ok(Json(state.hub().get(job_id).await?))
}

/// `GET /jobs/{id}/events/list`: the job's progress records, oldest first.
pub async fn list_progress_handler(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> AppResult<Json<Vec<ProgressRecord>>> {
    let hub = state.hub();
    hub.get(job_id).await?;
    let batch = hub
        .log()
        .read_after(job_id, LogCursor::default(), PROGRESS_LIST_LIMIT)
        .await?;
    Ok(Json(batch.records))
}

/// Creates a job and starts its scan. A job whose start fails stays queued
/// for the dispatcher.
pub async fn create_job_handler(
    State(state): State<AppState>,
    Json(request): Json<NewJob>,
) -> AppResult<impl IntoResponse> {
    let job = state.hub().create_job(request).await?;
    match state.hub().start_job(job.id).await {
        Ok(handle) => state.scans.track(handle),
        Err(err) => warn!(job = %job.id, error = %err, "job created but scan did not start"),
    }
    Ok((StatusCode::CREATED, Json(job)))
}

pub async fn delete_job_handler(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> AppResult<Json<OkResponse>> {
    let removed = state.hub().remove_job(job_id).await?;
    if !removed {
        info!(job = %job_id, "delete requested for unknown job");
    }
    Ok(Json(OkResponse { ok: true }))
}

pub async fn cancel_scan_handler(
    State(state): State<AppState>,
    Path(scan_id): Path<JobId>,
) -> AppResult<Json<CancelResponse>> {
    let cancelled = state.hub().cancel(scan_id).await?;
    Ok(Json(CancelResponse {
        ok: true,
        cancelled,
    }))
}
