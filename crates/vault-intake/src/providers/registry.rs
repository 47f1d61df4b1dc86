//! Backend lookup by category and path

use std::collections::HashMap;
use std::sync::Arc;

use super::{ExtractionBackend, HttpBackend, LocalBackend};
use crate::config::BackendConfig;
use crate::types::{PathMode, ProcessingCategory};

/// Resolves the backend serving a (category, path) pair
pub struct BackendRegistry {
    routes: HashMap<(ProcessingCategory, PathMode), Arc<dyn ExtractionBackend>>,
    fallback: Arc<dyn ExtractionBackend>,
}

impl BackendRegistry {
    /// Registry where every category uses the in-process backend
    pub fn local() -> Self {
        Self {
            routes: HashMap::new(),
            fallback: Arc::new(LocalBackend::new()),
        }
    }

    /// Build from configured HTTP backends; the first backend listed for a pair wins
    pub fn from_config(backends: &[BackendConfig]) -> Self {
        let client = reqwest::Client::new();
        let mut registry = Self::local();

        for config in backends {
            let backend: Arc<dyn ExtractionBackend> =
                Arc::new(HttpBackend::with_client(config, client.clone()));
            for category in &config.categories {
                for mode in &config.paths {
                    registry
                        .routes
                        .entry((*category, *mode))
                        .or_insert_with(|| Arc::clone(&backend));
                }
            }
            tracing::info!(
                "Registered backend {} at {} for {:?}",
                config.id,
                config.url,
                config.categories
            );
        }

        registry
    }

    /// Route a pair to a specific backend
    pub fn with(
        mut self,
        category: ProcessingCategory,
        mode: PathMode,
        backend: Arc<dyn ExtractionBackend>,
    ) -> Self {
        self.routes.insert((category, mode), backend);
        self
    }

    pub fn resolve(&self, category: ProcessingCategory, mode: PathMode) -> Arc<dyn ExtractionBackend> {
        self.routes
            .get(&(category, mode))
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.fallback))
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::local()
    }
}
