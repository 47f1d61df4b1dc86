//! In-process backend used when no remote service is configured for a category
//!
//! The fast path reports what detection already knows about the file. The deep
//! path reads plain-text formats directly and lists the members of ZIP
//! containers.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::Path;
use tokio::io::AsyncReadExt;

use super::{BackendError, ContentHandle, Extraction, ExtractionBackend};
use crate::types::PathMode;

/// Upper bound on text read by the deep path
const MAX_DEEP_TEXT: u64 = 1024 * 1024;

/// Upper bound on listed container members
const MAX_LISTED_ENTRIES: usize = 256;

pub const LOCAL_BACKEND_ID: &str = "local";

/// Local filesystem backend
#[derive(Debug, Default)]
pub struct LocalBackend;

impl LocalBackend {
    pub fn new() -> Self {
        Self
    }

    fn is_text(handle: &ContentHandle) -> bool {
        handle.mime.starts_with("text/")
            || matches!(
                handle.mime.as_str(),
                "application/json" | "application/xml" | "message/rfc822"
            )
    }

    fn is_zip(handle: &ContentHandle) -> bool {
        matches!(
            handle.subtype.as_str(),
            "zip" | "docx" | "xlsx" | "pptx" | "odt" | "ods" | "odp" | "epub" | "apk" | "ipa"
        )
    }

    fn summary(handle: &ContentHandle) -> String {
        format!(
            "{}: {} ({}), {} bytes, category {}",
            handle.file_name, handle.mime, handle.subtype, handle.size_bytes, handle.category
        )
    }

    async fn read_text(path: &Path) -> Result<String, BackendError> {
        let file = tokio::fs::File::open(path).await.map_err(io_error)?;
        let mut buf = Vec::new();
        file.take(MAX_DEEP_TEXT)
            .read_to_end(&mut buf)
            .await
            .map_err(io_error)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    async fn list_zip(path: &Path) -> Result<String, BackendError> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let file = std::fs::File::open(&path).map_err(io_error)?;
            let mut archive = zip::ZipArchive::new(file)
                .map_err(|e| BackendError::content("corrupt", format!("unreadable zip: {}", e)))?;
            let mut names = Vec::new();
            for i in 0..archive.len().min(MAX_LISTED_ENTRIES) {
                let entry = archive
                    .by_index(i)
                    .map_err(|e| BackendError::content("corrupt", format!("bad zip entry: {}", e)))?;
                names.push(entry.name().to_string());
            }
            Ok(names.join("\n"))
        })
        .await
        .map_err(|e| BackendError::Transient(format!("Task join error: {}", e)))?
    }
}

fn io_error(err: std::io::Error) -> BackendError {
    match err.kind() {
        ErrorKind::NotFound => BackendError::content("missing", format!("source file gone: {}", err)),
        ErrorKind::PermissionDenied => BackendError::Transient(format!("permission denied: {}", err)),
        _ => BackendError::Transient(err.to_string()),
    }
}

#[async_trait]
impl ExtractionBackend for LocalBackend {
    fn id(&self) -> &str {
        LOCAL_BACKEND_ID
    }

    async fn extract(
        &self,
        handle: &ContentHandle,
        mode: PathMode,
    ) -> Result<Extraction, BackendError> {
        match mode {
            PathMode::Fast => {
                tokio::fs::metadata(&handle.path).await.map_err(io_error)?;
                Ok(Extraction {
                    content: Self::summary(handle),
                    confidence: 0.3,
                })
            }
            PathMode::Deep if Self::is_text(handle) => Ok(Extraction {
                content: Self::read_text(&handle.path).await?,
                confidence: 0.9,
            }),
            PathMode::Deep if Self::is_zip(handle) => {
                let listing = Self::list_zip(&handle.path).await?;
                Ok(Extraction {
                    content: format!("{}\n{}", Self::summary(handle), listing),
                    confidence: 0.6,
                })
            }
            PathMode::Deep => {
                tokio::fs::metadata(&handle.path).await.map_err(io_error)?;
                Ok(Extraction {
                    content: Self::summary(handle),
                    confidence: 0.5,
                })
            }
        }
    }
}
