//! Dead-letter review and resubmission

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;

use crate::error::Result;
use crate::pipeline::SubmitReceipt;
use crate::processing::DeadLetterEntry;
use crate::server::state::{parse_job_id, AppState};

#[derive(Debug, Serialize)]
pub struct DeadLetterList {
    pub total: usize,
    pub entries: Vec<DeadLetterEntry>,
}

/// GET /api/dead-letters - All dead letters, oldest first
pub async fn list_dead_letters(State(state): State<AppState>) -> Json<DeadLetterList> {
    let entries = state.pipeline().dead_letters();
    Json(DeadLetterList {
        total: entries.len(),
        entries,
    })
}

/// GET /api/dead-letters/:id
pub async fn get_dead_letter(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeadLetterEntry>> {
    let id = parse_job_id(&id)?;
    Ok(Json(state.pipeline().dead_letter(&id)?))
}

/// POST /api/dead-letters/:id/resubmit - Requeue with a fresh retry budget
pub async fn resubmit_dead_letter(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<SubmitReceipt>)> {
    let id = parse_job_id(&id)?;
    let receipt = state.pipeline().resubmit(&id).await?;
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}
