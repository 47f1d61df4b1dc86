//! Error types for the intake core

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Result type alias for intake operations
pub type Result<T> = std::result::Result<T, Error>;

/// Intake errors
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// File could not be read at header level; usually transient
    #[error("Detection failed for '{path}': {message}")]
    Detection { path: String, message: String },

    /// File content is corrupt, encrypted or an unsupported variant
    #[error("Content error ({kind}): {message}")]
    Content { kind: String, message: String },

    /// Job not found
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// Dead letter not found
    #[error("Dead letter not found: {0}")]
    DeadLetterNotFound(String),

    /// Malformed request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP request error
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a detection error
    pub fn detection(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Detection {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a content error
    pub fn content(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Content {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Whether retrying the same operation later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Detection { .. } | Error::Io(_) | Error::Http(_))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Database(err.to_string())
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match &self {
            Error::Config(msg) => (StatusCode::BAD_REQUEST, "config_error", msg.clone()),
            Error::Detection { path, message } => (
                StatusCode::SERVICE_UNAVAILABLE,
                "detection_error",
                format!("Could not read '{}': {}", path, message),
            ),
            Error::Content { kind, message } => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "content_error",
                format!("{}: {}", kind, message),
            ),
            Error::JobNotFound(id) => (
                StatusCode::NOT_FOUND,
                "not_found",
                format!("Job not found: {}", id),
            ),
            Error::DeadLetterNotFound(id) => (
                StatusCode::NOT_FOUND,
                "not_found",
                format!("Dead letter not found: {}", id),
            ),
            Error::InvalidRequest(msg) => (StatusCode::BAD_REQUEST, "invalid_request", msg.clone()),
            Error::Io(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "io_error",
                err.to_string(),
            ),
            Error::Json(err) => (StatusCode::BAD_REQUEST, "json_error", err.to_string()),
            Error::Http(err) => (
                StatusCode::BAD_GATEWAY,
                "http_error",
                err.to_string(),
            ),
            Error::Database(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "database_error", msg.clone())
            }
            Error::Internal(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg.clone())
            }
        };

        let body = Json(json!({
            "error": {
                "type": error_type,
                "message": message,
            }
        }));

        if matches!(self, Error::Detection { .. }) {
            return (status, [(header::RETRY_AFTER, "5")], body).into_response();
        }

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detection_error_is_transient_and_503() {
        let err = Error::detection("/tmp/a.pdf", "permission denied");
        assert!(err.is_transient());

        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            "5"
        );
    }

    #[test]
    fn test_content_error_is_permanent() {
        let err = Error::content("corrupt", "bad xref table");
        assert!(!err.is_transient());
        assert_eq!(err.into_response().status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn test_internal_error_is_500_and_not_retried() {
        let err = Error::internal("Task join error: cancelled");
        assert!(!err.is_transient());
        assert_eq!(err.to_string(), "Internal error: Task join error: cancelled");
        assert_eq!(err.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
