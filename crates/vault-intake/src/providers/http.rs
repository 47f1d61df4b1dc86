//! Remote extraction service reached over HTTP
//!
//! The request carries the file location and detected format; the service is
//! expected to read the file itself (shared volume) and answer with
//! `{"content": ..., "confidence": ...}`.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use super::{BackendError, ContentHandle, Extraction, ExtractionBackend};
use crate::config::BackendConfig;
use crate::processing::retry::is_transient_message;
use crate::types::{PathMode, ProcessingCategory};

#[derive(Debug, Serialize)]
struct ExtractRequest<'a> {
    job_id: &'a str,
    path: String,
    file_name: &'a str,
    mime: &'a str,
    subtype: &'a str,
    category: ProcessingCategory,
    size_bytes: u64,
    mode: PathMode,
}

#[derive(Debug, Deserialize)]
struct ExtractResponse {
    content: String,
    #[serde(default = "default_confidence")]
    confidence: f32,
}

fn default_confidence() -> f32 { 1.0 }

/// HTTP extraction backend
pub struct HttpBackend {
    id: String,
    url: String,
    client: reqwest::Client,
}

impl HttpBackend {
    pub fn new(config: &BackendConfig) -> Self {
        Self::with_client(config, reqwest::Client::new())
    }

    /// Share one connection pool across backends
    pub fn with_client(config: &BackendConfig, client: reqwest::Client) -> Self {
        Self {
            id: config.id.clone(),
            url: config.url.clone(),
            client,
        }
    }
}

/// Map a non-success HTTP answer to a backend error
fn classify_status(status: StatusCode, body: &str) -> BackendError {
    let message = if body.is_empty() {
        status.to_string()
    } else {
        format!("{}: {}", status, body)
    };

    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        return BackendError::Transient(message);
    }
    if status == StatusCode::UNSUPPORTED_MEDIA_TYPE || status == StatusCode::UNPROCESSABLE_ENTITY {
        return BackendError::content("rejected", message);
    }
    // other 4xx are rejections unless the body names an infrastructure problem
    if is_transient_message(body) {
        BackendError::Transient(message)
    } else {
        BackendError::content("rejected", message)
    }
}

#[async_trait]
impl ExtractionBackend for HttpBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn extract(
        &self,
        handle: &ContentHandle,
        mode: PathMode,
    ) -> Result<Extraction, BackendError> {
        let request = ExtractRequest {
            job_id: handle.job_id.as_str(),
            path: handle.path.to_string_lossy().into_owned(),
            file_name: &handle.file_name,
            mime: &handle.mime,
            subtype: &handle.subtype,
            category: handle.category,
            size_bytes: handle.size_bytes,
            mode,
        };

        tracing::debug!("[{}] {} extraction via {}", handle.file_name, mode, self.id);

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| BackendError::Transient(format!("{} request failed: {}", self.id, e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let parsed: ExtractResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Transient(format!("Failed to parse {} response: {}", self.id, e)))?;

        Ok(Extraction {
            content: parsed.content,
            confidence: parsed.confidence.clamp(0.0, 1.0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::JobId;
    use axum::{http::StatusCode as AxumStatus, routing::post, Json, Router};
    use serde_json::{json, Value};
    use std::path::PathBuf;

    fn handle() -> ContentHandle {
        ContentHandle {
            job_id: JobId::for_bytes(b"http"),
            path: PathBuf::from("/srv/vault/report.pdf"),
            file_name: "report.pdf".to_string(),
            mime: "application/pdf".to_string(),
            subtype: "pdf".to_string(),
            category: ProcessingCategory::Documents,
            size_bytes: 1024,
        }
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}/extract", addr)
    }

    fn backend(url: String) -> HttpBackend {
        HttpBackend::new(&BackendConfig {
            id: "remote".to_string(),
            url,
            categories: vec![ProcessingCategory::Documents],
            paths: vec![PathMode::Fast, PathMode::Deep],
        })
    }

    #[test]
    fn test_status_classification() {
        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE, "").is_transient());
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(!classify_status(StatusCode::UNPROCESSABLE_ENTITY, "").is_transient());
        assert!(!classify_status(StatusCode::BAD_REQUEST, "file is encrypted").is_transient());
        assert!(classify_status(StatusCode::BAD_REQUEST, "connection reset by peer").is_transient());
    }

    #[test]
    fn test_unrecognised_client_error_is_rejection() {
        let err = classify_status(StatusCode::BAD_REQUEST, "unsupported pdf variant");
        assert!(!err.is_transient());
        assert!(matches!(err, BackendError::Content { .. }));
        assert!(!classify_status(StatusCode::FORBIDDEN, "").is_transient());
    }

    #[tokio::test]
    async fn test_successful_extraction() {
        let router = Router::new().route(
            "/extract",
            post(|Json(body): Json<Value>| async move {
                Json(json!({ "content": format!("{} via {}", body["file_name"], body["mode"]), "confidence": 0.7 }))
            }),
        );
        let backend = backend(serve(router).await);

        let extraction = backend.extract(&handle(), PathMode::Deep).await.unwrap();
        assert_eq!(extraction.content, "\"report.pdf\" via \"deep\"");
        assert!((extraction.confidence - 0.7).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let router = Router::new().route(
            "/extract",
            post(|| async { (AxumStatus::BAD_GATEWAY, "upstream down") }),
        );
        let backend = backend(serve(router).await);

        let err = backend.extract(&handle(), PathMode::Fast).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_transient() {
        let backend = backend("http://127.0.0.1:9/extract".to_string());
        let err = backend.extract(&handle(), PathMode::Fast).await.unwrap_err();
        assert!(matches!(err, BackendError::Transient(_)));
    }
}
