//! HTTP server for the intake pipeline

pub mod routes;
pub mod state;

use axum::{routing::get, Router};
use std::net::SocketAddr;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::config::IntakeConfig;
use crate::error::Result;
use state::AppState;

/// Intake HTTP server
pub struct IntakeServer {
    config: IntakeConfig,
    state: AppState,
}

impl IntakeServer {
    /// Create a new server; recovers persisted jobs and starts the dispatcher
    pub fn new(config: IntakeConfig) -> Result<Self> {
        let state = AppState::new(config.clone())?;
        Ok(Self { config, state })
    }

    /// Create from prepared state
    pub fn with_state(config: IntakeConfig, state: AppState) -> Self {
        Self { config, state }
    }

    /// Build the router with all routes
    pub fn build_router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        Router::new()
            .route("/health", get(health_check))
            .route("/ready", get(readiness))
            .nest("/api", routes::api_routes(self.config.server.max_body_size))
            .with_state(self.state.clone())
            // Middleware layers (order matters - applied bottom to top)
            .layer(TraceLayer::new_for_http())
            .layer(CompressionLayer::new())
            .layer(cors)
    }

    /// Serve until ctrl-c, then drain the dispatcher
    pub async fn start(self) -> Result<()> {
        let addr: SocketAddr = self
            .address()
            .parse()
            .map_err(|e| crate::error::Error::Config(format!("Invalid address: {}", e)))?;

        let router = self.build_router();

        tracing::info!("Starting intake server on http://{}", addr);

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| crate::error::Error::Config(format!("Failed to bind: {}", e)))?;

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| crate::error::Error::internal(format!("Server error: {}", e)))?;

        self.state.set_ready(false);
        tracing::info!("Draining in-flight jobs...");
        self.state.pipeline().shutdown().await;
        Ok(())
    }

    /// Get the server address
    pub fn address(&self) -> String {
        format!("{}:{}", self.config.server.host, self.config.server.port)
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}

/// Readiness check endpoint
async fn readiness(state: axum::extract::State<AppState>) -> axum::http::StatusCode {
    if state.is_ready() {
        axum::http::StatusCode::OK
    } else {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::IntakePipeline;
    use crate::providers::{BackendRegistry, TracingPublisher};
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn server() -> IntakeServer {
        let mut config = IntakeConfig::default();
        config.storage.enabled = false;
        let pipeline = Arc::new(IntakePipeline::with_components(
            config.clone(),
            None,
            BackendRegistry::local(),
            Arc::new(TracingPublisher),
        ));
        let state = AppState::with_pipeline(config.clone(), pipeline);
        IntakeServer::with_state(config, state)
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_and_ready() {
        let router = server().build_router();
        let health = router
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(health.status(), StatusCode::OK);

        let ready = router
            .oneshot(Request::get("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(ready.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_submit_then_duplicate_then_status() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("invoice.pdf");
        std::fs::write(&path, b"%PDF-1.7 invoice\n%%EOF\n").unwrap();
        let router = server().build_router();

        let first = router
            .clone()
            .oneshot(post_json("/api/jobs", serde_json::json!({ "path": path })))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::ACCEPTED);
        let receipt = json_body(first).await;
        let id = receipt["job_id"].as_str().unwrap().to_string();
        assert_eq!(receipt["category"], "documents");

        let second = router
            .clone()
            .oneshot(post_json("/api/jobs", serde_json::json!({ "path": path })))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(json_body(second).await["duplicate"], true);

        let status = router
            .oneshot(
                Request::get(format!("/api/jobs/{}", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(status.status(), StatusCode::OK);
        assert_eq!(json_body(status).await["job"]["id"], id.as_str());
    }

    #[tokio::test]
    async fn test_missing_file_maps_to_unavailable() {
        let router = server().build_router();
        let response = router
            .oneshot(post_json(
                "/api/jobs",
                serde_json::json!({ "path": "/nonexistent/file.pdf" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_malformed_and_unknown_ids() {
        let router = server().build_router();
        let malformed = router
            .clone()
            .oneshot(Request::get("/api/jobs/not-a-hash").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(malformed.status(), StatusCode::BAD_REQUEST);

        let unknown = router
            .oneshot(
                Request::get(format!("/api/dead-letters/{}", "ab".repeat(32)))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(unknown.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_info_reports_configured_limits() {
        let router = server().build_router();
        let response = router
            .oneshot(Request::get("/api/info").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let info = json_body(response).await;
        let defaults = IntakeConfig::default();
        assert_eq!(info["limits"]["max_retries"], defaults.retry.max_retries);
        assert_eq!(info["limits"]["min_dispatch_share"], defaults.queue.min_dispatch_share);
    }

    #[tokio::test]
    async fn test_stats_endpoint() {
        let router = server().build_router();
        let response = router
            .oneshot(Request::get("/api/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let stats = json_body(response).await;
        assert_eq!(stats["workers"].as_array().unwrap().len(), 7);
        assert_eq!(stats["dead_letters"], 0);
    }
}
