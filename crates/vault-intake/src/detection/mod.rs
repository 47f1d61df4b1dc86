//! Format and container detection
//!
//! Classifies a file from its leading bytes and, for generic containers
//! (ZIP, OLE2, RIFF, ISO media), from the container directory. The filename
//! extension is only consulted when no signature matches. Detection reads a
//! bounded header window plus at most one container directory; it never
//! parses file payloads.

mod container;
mod signatures;

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use crate::config::DetectionConfig;
use crate::error::{Error, Result};
use crate::types::ProcessingCategory;

pub use container::ContainerVerdict;
pub use signatures::{category_for_mime, ContainerKind, Format, SignatureMatch};

/// How the type was established
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    /// Byte signature
    Magic,
    /// Container directory or brand code
    Container,
    /// Filename extension or declared type
    Extension,
}

/// A successful classification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Detection {
    pub mime: String,
    pub subtype: String,
    pub confidence: Confidence,
    pub category: ProcessingCategory,
}

impl Detection {
    /// Placeholder for files that could not be classified
    pub fn unknown() -> Self {
        Self::from_format(signatures::UNKNOWN, Confidence::Extension)
    }

    fn from_format(format: Format, confidence: Confidence) -> Self {
        Self {
            mime: format.mime.to_string(),
            subtype: format.subtype.to_string(),
            confidence,
            category: format.category,
        }
    }
}

/// Why a file could not be classified at all
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason", content = "detail")]
pub enum UnknownReason {
    /// Zero bytes
    Empty,
    /// Structure promised by the signature is cut short
    Truncated(String),
}

/// Detector output; `Unknown` files go straight to quarantine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum DetectionOutcome {
    Detected(Detection),
    Unknown { reason: UnknownReason },
}

/// How far from the end a format trailer may sit
const TRAILER_WINDOW: u64 = 1024;

/// Whether `trailer` occurs in the last `TRAILER_WINDOW` bytes
fn ends_with_trailer<R: Read + Seek>(reader: &mut R, len: u64, trailer: &[u8]) -> std::io::Result<bool> {
    let start = len.saturating_sub(TRAILER_WINDOW);
    reader.seek(SeekFrom::Start(start))?;
    let mut tail = Vec::with_capacity((len - start) as usize);
    reader.take(TRAILER_WINDOW).read_to_end(&mut tail)?;
    Ok(tail.windows(trailer.len()).any(|w| w == trailer))
}

/// Format and container detector
#[derive(Debug, Clone)]
pub struct Detector {
    header_window: usize,
    max_container_entries: usize,
}

impl Default for Detector {
    fn default() -> Self {
        Self::new(&DetectionConfig::default())
    }
}

impl Detector {
    pub fn new(config: &DetectionConfig) -> Self {
        Self {
            header_window: config.header_window.max(64),
            max_container_entries: config.max_container_entries,
        }
    }

    /// Detect a file on disk. I/O failures are `Error::Detection`, not `Unknown`.
    pub fn detect_path(&self, path: &Path, declared_type: Option<&str>) -> Result<DetectionOutcome> {
        let display = path.display().to_string();
        let file = File::open(path).map_err(|e| Error::detection(&display, e.to_string()))?;
        let len = file
            .metadata()
            .map_err(|e| Error::detection(&display, e.to_string()))?
            .len();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        self.detect_reader(BufReader::new(file), len, &file_name, declared_type)
            .map_err(|e| Error::detection(&display, e.to_string()))
    }

    /// Detect from any seekable source of known length
    pub fn detect_reader<R: Read + Seek>(
        &self,
        mut reader: R,
        len: u64,
        file_name: &str,
        declared_type: Option<&str>,
    ) -> std::io::Result<DetectionOutcome> {
        if len == 0 {
            return Ok(DetectionOutcome::Unknown { reason: UnknownReason::Empty });
        }

        let mut header = Vec::with_capacity(self.header_window);
        reader
            .by_ref()
            .take(self.header_window as u64)
            .read_to_end(&mut header)?;
        if header.is_empty() {
            return Ok(DetectionOutcome::Unknown { reason: UnknownReason::Empty });
        }

        let detection = match signatures::match_signature(&header) {
            Some(SignatureMatch::Format(format)) => {
                if let Some(trailer) = signatures::required_trailer(format) {
                    if !ends_with_trailer(&mut reader, len, trailer)? {
                        tracing::debug!("{} in {} has no end marker", format.subtype, file_name);
                        return Ok(DetectionOutcome::Unknown {
                            reason: UnknownReason::Truncated(format!(
                                "{} ends without its end marker",
                                format.subtype
                            )),
                        });
                    }
                }
                Detection::from_format(format, Confidence::Magic)
            }
            Some(SignatureMatch::Container(kind)) => {
                reader.seek(SeekFrom::Start(0))?;
                match container::inspect(kind, &header, &mut reader, self.max_container_entries) {
                    ContainerVerdict::Identified(format) => {
                        Detection::from_format(format, Confidence::Container)
                    }
                    ContainerVerdict::Generic(format) => {
                        Detection::from_format(format, Confidence::Magic)
                    }
                    ContainerVerdict::Unreadable(detail) => {
                        tracing::debug!("Container in {} unreadable: {}", file_name, detail);
                        return Ok(DetectionOutcome::Unknown {
                            reason: UnknownReason::Truncated(detail),
                        });
                    }
                }
            }
            None => self.from_hints(file_name, declared_type),
        };

        Ok(DetectionOutcome::Detected(detection))
    }

    /// Declared type first, then the filename extension
    fn from_hints(&self, file_name: &str, declared_type: Option<&str>) -> Detection {
        let extension = Path::new(file_name)
            .extension()
            .map(|e| e.to_string_lossy().into_owned());

        let hints = declared_type.into_iter().chain(extension.as_deref());
        for hint in hints {
            if let Some(format) = signatures::format_for_hint(hint) {
                return Detection::from_format(format, Confidence::Extension);
            }
            if let Some((mime, category)) = signatures::guess_mime(hint) {
                let subtype = mime
                    .rsplit('/')
                    .next()
                    .unwrap_or("unknown")
                    .trim_start_matches("x-")
                    .to_string();
                return Detection {
                    mime,
                    subtype,
                    confidence: Confidence::Extension,
                    category,
                };
            }
        }

        Detection::from_format(signatures::UNKNOWN, Confidence::Extension)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};

    fn detect(bytes: &[u8], name: &str) -> DetectionOutcome {
        Detector::default()
            .detect_reader(Cursor::new(bytes.to_vec()), bytes.len() as u64, name, None)
            .unwrap()
    }

    fn detected(outcome: DetectionOutcome) -> Detection {
        match outcome {
            DetectionOutcome::Detected(d) => d,
            other => panic!("expected detection, got {:?}", other),
        }
    }

    #[test]
    fn test_pdf_magic_ignores_extension() {
        let d = detected(detect(b"%PDF-1.7\n%\xE2\xE3\xCF\xD3\n1 0 obj\n%%EOF\n", "scan.jpg"));
        assert_eq!(d.confidence, Confidence::Magic);
        assert_eq!(d.category, ProcessingCategory::Documents);
        assert_eq!(d.subtype, "pdf");
    }

    #[test]
    fn test_office_zip_is_documents_not_archive() {
        let mut buf = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buf);
            let options = zip::write::SimpleFileOptions::default();
            writer.start_file("[Content_Types].xml", options).unwrap();
            writer.write_all(b"<Types/>").unwrap();
            writer.start_file("word/document.xml", options).unwrap();
            writer.write_all(b"<w:document/>").unwrap();
            writer.finish().unwrap();
        }
        let d = detected(detect(&buf.into_inner(), "upload.zip"));
        assert_eq!(d.confidence, Confidence::Container);
        assert_eq!(d.category, ProcessingCategory::Documents);
        assert_eq!(d.subtype, "docx");
    }

    #[test]
    fn test_extension_fallback() {
        let d = detected(detect(b"just some notes", "notes.txt"));
        assert_eq!(d.confidence, Confidence::Extension);
        assert_eq!(d.subtype, "txt");

        let d = detected(detect(b"id,name\n1,a\n", "export.csv"));
        assert_eq!(d.subtype, "csv");
        assert_eq!(d.category, ProcessingCategory::Documents);
    }

    #[test]
    fn test_declared_type_beats_extension() {
        let outcome = Detector::default()
            .detect_reader(Cursor::new(b"hello".to_vec()), 5, "blob.bin", Some("eml"))
            .unwrap();
        let d = detected(outcome);
        assert_eq!(d.category, ProcessingCategory::Communication);
        assert_eq!(d.confidence, Confidence::Extension);
    }

    #[test]
    fn test_unrecognised_is_other() {
        let d = detected(detect(b"\x00\x01\x02\x03", "mystery"));
        assert_eq!(d.category, ProcessingCategory::Other);
        assert_eq!(d.mime, "application/octet-stream");
    }

    #[test]
    fn test_empty_and_truncated_are_unknown() {
        assert_eq!(
            detect(b"", "empty.pdf"),
            DetectionOutcome::Unknown { reason: UnknownReason::Empty }
        );
        assert!(matches!(
            detect(b"PK\x03\x04\x14\x00\x00\x00", "cut.docx"),
            DetectionOutcome::Unknown { reason: UnknownReason::Truncated(_) }
        ));
    }

    #[test]
    fn test_cut_pdf_and_images_are_truncated() {
        let truncated = |outcome: DetectionOutcome| {
            matches!(outcome, DetectionOutcome::Unknown { reason: UnknownReason::Truncated(_) })
        };
        assert!(truncated(detect(b"%PDF-1.7\n1 0 obj\n<< /Length 4", "cut.pdf")));
        assert!(truncated(detect(b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR", "cut.png")));
        assert!(truncated(detect(b"\xFF\xD8\xFF\xE0\0\x10JFIF\0", "cut.jpg")));

        let png = detected(detect(b"\x89PNG\r\n\x1a\n\0\0\0\0IEND\xAEB`\x82", "ok.png"));
        assert_eq!(png.subtype, "png");
        let jpeg = detected(detect(b"\xFF\xD8\xFF\xE0\0\x10JFIF\0\xFF\xD9", "ok.jpg"));
        assert_eq!(jpeg.category, ProcessingCategory::Images);
    }

    #[test]
    fn test_pdf_marker_may_sit_before_trailing_bytes() {
        let mut bytes = b"%PDF-1.4\n".to_vec();
        bytes.resize(4096, b' ');
        bytes.extend_from_slice(b"\n%%EOF\n\n");
        assert_eq!(detected(detect(&bytes, "padded.pdf")).subtype, "pdf");

        // Marker early in the file but absent from the tail
        let mut early = b"%PDF-1.4\n%%EOF\n".to_vec();
        early.resize(4096, b' ');
        assert!(matches!(
            detect(&early, "early.pdf"),
            DetectionOutcome::Unknown { reason: UnknownReason::Truncated(_) }
        ));
    }

    #[test]
    fn test_detect_path_reads_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("song.bin");
        std::fs::write(&path, b"ID3\x04\x00\x00\x00\x00\x00\x00").unwrap();

        let d = detected(Detector::default().detect_path(&path, None).unwrap());
        assert_eq!(d.category, ProcessingCategory::Audio);
        assert_eq!(d.confidence, Confidence::Magic);
    }

    #[test]
    fn test_missing_file_is_detection_failure() {
        let err = Detector::default()
            .detect_path(Path::new("/definitely/not/here.pdf"), None)
            .unwrap_err();
        assert!(matches!(err, Error::Detection { .. }));
        assert!(err.is_transient());
    }
}
