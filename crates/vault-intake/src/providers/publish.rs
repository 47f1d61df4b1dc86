//! Downstream notification of visible results
//!
//! The coordinator calls a publisher once per accepted slot write: once when a
//! fast result becomes visible and once when the merged deep result replaces it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::PublishConfig;
use crate::error::{Error, Result};
use crate::types::{JobId, ProcessingResult};

/// Which write produced the event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishKind {
    Fast,
    Merged,
}

/// A result that just became visible
#[derive(Debug, Clone, Serialize)]
pub struct PublishEvent {
    pub job_id: JobId,
    pub source_path: PathBuf,
    pub kind: PublishKind,
    pub version: u64,
    pub result: Arc<ProcessingResult>,
    pub published_at: DateTime<Utc>,
}

/// Receiver of visible results
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, event: &PublishEvent) -> Result<()>;

    fn name(&self) -> &str;
}

/// Logs events; used when no downstream endpoint is configured
#[derive(Debug, Default)]
pub struct TracingPublisher;

#[async_trait]
impl Publisher for TracingPublisher {
    async fn publish(&self, event: &PublishEvent) -> Result<()> {
        tracing::info!(
            "Published {:?} result v{} for {} ({}, {} chars)",
            event.kind,
            event.version,
            event.job_id.short(),
            event.source_path.display(),
            event.result.content.len()
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "tracing"
    }
}

/// Posts events as JSON to a downstream endpoint
pub struct HttpPublisher {
    url: String,
    client: reqwest::Client,
}

impl HttpPublisher {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Publisher for HttpPublisher {
    async fn publish(&self, event: &PublishEvent) -> Result<()> {
        let response = self.client.post(&self.url).json(event).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::internal(format!(
                "Publish to {} failed ({}): {}",
                self.url, status, body
            )));
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "http"
    }
}

/// Publisher selected by configuration
pub fn from_config(config: &PublishConfig) -> Arc<dyn Publisher> {
    match &config.url {
        Some(url) => Arc::new(HttpPublisher::new(url.clone())),
        None => Arc::new(TracingPublisher),
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PathMode;

    #[test]
    fn test_from_config_selects_publisher() {
        assert_eq!(from_config(&PublishConfig::default()).name(), "tracing");
        let http = from_config(&PublishConfig {
            url: Some("http://downstream/events".to_string()),
        });
        assert_eq!(http.name(), "http");
    }

    fn event(kind: PublishKind) -> PublishEvent {
        PublishEvent {
            job_id: JobId::for_bytes(b"evt"),
            source_path: PathBuf::from("/vault/a.pdf"),
            kind,
            version: 2,
            result: Arc::new(ProcessingResult {
                content: "text".to_string(),
                confidence: 0.9,
                backend_id: "local".to_string(),
                duration_ms: 10,
                path: PathMode::Deep,
                produced_at: Utc::now(),
            }),
            published_at: Utc::now(),
        }
    }

    #[test]
    fn test_event_serializes_kind_lowercase() {
        let json = serde_json::to_value(event(PublishKind::Merged)).unwrap();
        assert_eq!(json["kind"], "merged");
        assert_eq!(json["result"]["path"], "deep");
    }

    #[test]
    fn test_recording_publisher_keeps_order() {
        let recorder = test_support::RecordingPublisher::default();
        tokio_test::block_on(async {
            recorder.publish(&event(PublishKind::Fast)).await.unwrap();
            recorder.publish(&event(PublishKind::Merged)).await.unwrap();
        });
        let kinds: Vec<_> = recorder.events().iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![PublishKind::Fast, PublishKind::Merged]);
    }
}
