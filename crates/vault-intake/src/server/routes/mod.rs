//! API routes for the intake server

pub mod dead_letters;
pub mod jobs;
pub mod stats;

use axum::{
    extract::{DefaultBodyLimit, State},
    routing::{get, post},
    Router,
};
use crate::server::state::AppState;

/// Build all API routes
pub fn api_routes(max_body_size: usize) -> Router<AppState> {
    Router::new()
        // Submission
        .route("/jobs", post(jobs::submit_job))
        .route("/jobs/batch", post(jobs::submit_batch))
        .route("/jobs/:id", get(jobs::get_job).delete(jobs::cancel_job))
        .route("/detect", post(jobs::detect))
        // Dead letters
        .route("/dead-letters", get(dead_letters::list_dead_letters))
        .route("/dead-letters/:id", get(dead_letters::get_dead_letter))
        .route(
            "/dead-letters/:id/resubmit",
            post(dead_letters::resubmit_dead_letter),
        )
        // Operations
        .route("/stats", get(stats::get_stats))
        .route("/info", get(info))
        .layer(DefaultBodyLimit::max(max_body_size))
}

/// API info endpoint with the limits this instance runs with
async fn info(State(state): State<AppState>) -> axum::Json<serde_json::Value> {
    let config = state.config();
    axum::Json(serde_json::json!({
        "name": "vault-intake",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Intake, triage and dispatch core for a document-processing pipeline",
        "endpoints": {
            "POST /api/jobs": "Submit a file by path",
            "POST /api/jobs/batch": "Submit every file under a directory",
            "GET /api/jobs/:id": "Job state, results and retry history",
            "DELETE /api/jobs/:id": "Cancel a job",
            "POST /api/detect": "Classify a file without queuing it",
            "GET /api/dead-letters": "List dead letters",
            "GET /api/dead-letters/:id": "Dead letter details",
            "POST /api/dead-letters/:id/resubmit": "Requeue a dead letter",
            "GET /api/stats": "Queue depth, workers and circuit breakers"
        },
        "limits": {
            "max_body_size": config.server.max_body_size,
            "min_dispatch_share": config.queue.min_dispatch_share,
            "visibility_timeout_secs": config.queue.visibility_timeout_secs,
            "max_retries": config.retry.max_retries,
            "breaker_failure_threshold": config.breaker.failure_threshold,
            "breaker_cooldown_secs": config.breaker.cooldown_secs,
            "fast_timeout_secs": config.coordinator.fast_timeout_secs,
            "deep_timeout_secs": config.coordinator.deep_timeout_secs,
            "deep_size_threshold": config.scoring.deep_size_threshold
        }
    }))
}
