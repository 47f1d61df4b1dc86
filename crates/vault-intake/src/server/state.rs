//! Application state for the intake server

use parking_lot::RwLock;
use std::sync::Arc;

use crate::config::IntakeConfig;
use crate::error::{Error, Result};
use crate::pipeline::IntakePipeline;
use crate::types::JobId;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    /// Configuration
    config: IntakeConfig,
    /// Intake pipeline (queues, dispatcher, dead letters)
    pipeline: Arc<IntakePipeline>,
    /// Ready state
    ready: RwLock<bool>,
}

impl AppState {
    /// Create new application state and start dispatching
    pub fn new(config: IntakeConfig) -> Result<Self> {
        tracing::info!("Initializing intake state...");
        let pipeline = Arc::new(IntakePipeline::new(config.clone())?);
        Ok(Self::with_pipeline(config, pipeline))
    }

    /// Wrap an existing pipeline; recovery and worker startup happen here
    pub fn with_pipeline(config: IntakeConfig, pipeline: Arc<IntakePipeline>) -> Self {
        let state = Self {
            inner: Arc::new(AppStateInner {
                config,
                pipeline,
                ready: RwLock::new(false),
            }),
        };

        match state.inner.pipeline.start() {
            Ok(recovered) => {
                tracing::info!("Dispatcher started ({} jobs recovered)", recovered);
                state.set_ready(true);
            }
            Err(e) => tracing::error!("Recovery failed, staying unready: {}", e),
        }
        state
    }

    /// Get configuration
    pub fn config(&self) -> &IntakeConfig {
        &self.inner.config
    }

    /// Get the intake pipeline
    pub fn pipeline(&self) -> &Arc<IntakePipeline> {
        &self.inner.pipeline
    }

    /// Check if the server is ready
    pub fn is_ready(&self) -> bool {
        *self.inner.ready.read()
    }

    /// Set ready state
    pub fn set_ready(&self, ready: bool) {
        *self.inner.ready.write() = ready;
    }
}

/// Parse a job id from a path segment
pub fn parse_job_id(raw: &str) -> Result<JobId> {
    JobId::parse(raw).ok_or_else(|| Error::InvalidRequest(format!("Malformed job id: {}", raw)))
}
