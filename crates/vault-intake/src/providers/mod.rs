//! Extraction backends and result publishers
//!
//! Backends are trait objects keyed by category and path so that the
//! coordinator can swap a local reader for a remote OCR or transcription
//! service without knowing which one it is talking to.

pub mod http;
pub mod local;
pub mod publish;
pub mod registry;

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::processing::retry::{classify_message, ErrorClass};
use crate::types::{Job, JobId, PathMode, ProcessingCategory};

pub use http::HttpBackend;
pub use local::LocalBackend;
pub use publish::{HttpPublisher, PublishEvent, PublishKind, Publisher, TracingPublisher};
pub use registry::BackendRegistry;

/// What a backend is told about the file it should process
#[derive(Debug, Clone)]
pub struct ContentHandle {
    pub job_id: JobId,
    pub path: PathBuf,
    pub file_name: String,
    pub mime: String,
    pub subtype: String,
    pub category: ProcessingCategory,
    pub size_bytes: u64,
}

impl From<&Job> for ContentHandle {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            path: job.source_path.clone(),
            file_name: job.file_name.clone(),
            mime: job.detection.mime.clone(),
            subtype: job.detection.subtype.clone(),
            category: job.category(),
            size_bytes: job.size_bytes,
        }
    }
}

/// Backend output before it is stamped into a `ProcessingResult`
#[derive(Debug, Clone)]
pub struct Extraction {
    pub content: String,
    pub confidence: f32,
}

/// Backend failure, already split into retryable and permanent
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    /// Connection failure, 5xx, rate limiting
    #[error("transient backend failure: {0}")]
    Transient(String),

    /// No answer within the path's deadline
    #[error("backend timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    /// The backend answered and refused the file itself
    #[error("content rejected ({kind}): {message}")]
    Content { kind: String, message: String },
}

impl BackendError {
    pub fn content(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Content {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Build from a free-form message using the shared classifier
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        match classify_message(&message) {
            ErrorClass::Content => Self::content("rejected", message),
            _ => Self::Transient(message),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            BackendError::Transient(_) | BackendError::Timeout(_) => ErrorClass::Transient,
            BackendError::Content { .. } => ErrorClass::Content,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class().is_retryable()
    }
}

/// A fast or deep extraction service
#[async_trait]
pub trait ExtractionBackend: Send + Sync {
    /// Stable id, also the circuit breaker key
    fn id(&self) -> &str;

    /// Process one file on the given path
    async fn extract(
        &self,
        handle: &ContentHandle,
        mode: PathMode,
    ) -> std::result::Result<Extraction, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_classes() {
        assert!(BackendError::Timeout(Duration::from_secs(30)).is_transient());
        assert!(BackendError::Transient("503".into()).is_transient());
        assert_eq!(
            BackendError::content("encrypted", "password protected").class(),
            ErrorClass::Content
        );
    }

    #[test]
    fn test_from_message_uses_classifier() {
        assert!(matches!(
            BackendError::from_message("corrupt xref table"),
            BackendError::Content { .. }
        ));
        assert!(matches!(
            BackendError::from_message("upstream 503"),
            BackendError::Transient(_)
        ));
    }
}
