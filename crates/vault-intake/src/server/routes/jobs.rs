//! Job submission, status and cancellation endpoints

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::detection::DetectionOutcome;
use crate::error::Result;
use crate::pipeline::{BatchReceipt, JobStatus, SubmitReceipt, SubmitRequest};
use crate::server::state::{parse_job_id, AppState};
use crate::types::JobState;

/// POST /api/jobs - Submit one file by path
pub async fn submit_job(
    State(state): State<AppState>,
    Json(request): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<SubmitReceipt>)> {
    let receipt = state.pipeline().submit(request).await?;
    let status = if receipt.duplicate {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    Ok((status, Json(receipt)))
}

/// Directory submission request
#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    pub root: PathBuf,
    #[serde(default = "default_recursive")]
    pub recursive: bool,
}

fn default_recursive() -> bool {
    true
}

/// POST /api/jobs/batch - Submit every file under a directory
pub async fn submit_batch(
    State(state): State<AppState>,
    Json(request): Json<BatchRequest>,
) -> Result<Json<BatchReceipt>> {
    let receipt = state
        .pipeline()
        .submit_directory(&request.root, request.recursive)
        .await?;
    tracing::info!(
        "Batch {}: {} submitted, {} failed",
        request.root.display(),
        receipt.submitted.len(),
        receipt.failed.len()
    );
    Ok(Json(receipt))
}

/// GET /api/jobs/:id - Current state, results and retry history
pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobStatus>> {
    let id = parse_job_id(&id)?;
    Ok(Json(state.pipeline().status(&id)?))
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub job_id: String,
    pub state: JobState,
}

/// DELETE /api/jobs/:id - Cancel a job
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CancelResponse>> {
    let id = parse_job_id(&id)?;
    let state = state.pipeline().cancel(&id)?;
    Ok(Json(CancelResponse {
        job_id: id.to_string(),
        state,
    }))
}

#[derive(Debug, Deserialize)]
pub struct DetectRequest {
    pub path: PathBuf,
    #[serde(default)]
    pub declared_type: Option<String>,
}

/// POST /api/detect - Classify a file without queuing it
pub async fn detect(
    State(state): State<AppState>,
    Json(request): Json<DetectRequest>,
) -> Result<Json<DetectionOutcome>> {
    let outcome = state
        .pipeline()
        .detect(&request.path, request.declared_type.as_deref())
        .await?;
    Ok(Json(outcome))
}
