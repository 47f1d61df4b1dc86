//! Operational statistics

use axum::{extract::State, Json};

use crate::pipeline::PipelineStats;
use crate::server::state::AppState;

/// GET /api/stats - Queue depth, worker utilization and breaker states
pub async fn get_stats(State(state): State<AppState>) -> Json<PipelineStats> {
    Json(state.pipeline().stats())
}
