//! Retry policy and failure classification

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::config::RetryConfig;
use crate::types::PathMode;

/// Terminal or per-attempt classification of a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Corrupt, encrypted or unsupported source file; never retried
    Content,
    /// Backend timeout, connection failure or 5xx
    Transient,
    /// Worker task panicked mid-job
    WorkerCrash,
    /// Empty or truncated file, quarantined at intake
    Quarantined,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::Transient | ErrorClass::WorkerCrash)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorClass::Content => "content",
            ErrorClass::Transient => "transient",
            ErrorClass::WorkerCrash => "worker_crash",
            ErrorClass::Quarantined => "quarantined",
        };
        f.write_str(s)
    }
}

/// One failed attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryRecord {
    /// Retry count after this failure
    pub attempt: u32,
    pub path: PathMode,
    pub class: ErrorClass,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Message fragments that mark a source-file problem
const CONTENT_PATTERNS: &[&str] = &[
    "corrupt",
    "damaged",
    "malformed",
    "truncated",
    "bad crc",
    "crc mismatch",
    "invalid header",
    "invalid file",
    "encrypted",
    "password protected",
    "password-protected",
    "unsupported format",
    "unsupported encoding",
    "not a valid",
    "empty file",
];

/// Message fragments that mark an infrastructure problem
const TRANSIENT_PATTERNS: &[&str] = &[
    "connection refused",
    "connection reset",
    "service unavailable",
    "temporarily unavailable",
    "502",
    "503",
    "504",
    "timeout",
    "timed out",
    "deadline exceeded",
    "out of memory",
    "too many requests",
];

/// Whether a message names an infrastructure problem outright
pub fn is_transient_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    TRANSIENT_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Classify a free-form backend error message.
/// Infrastructure patterns win over content patterns; unrecognised messages are transient.
pub fn classify_message(message: &str) -> ErrorClass {
    if is_transient_message(message) {
        return ErrorClass::Transient;
    }
    let lower = message.to_lowercase();
    if CONTENT_PATTERNS.iter().any(|p| lower.contains(p)) {
        return ErrorClass::Content;
    }
    ErrorClass::Transient
}

/// Exponential backoff with a bounded attempt count
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    base_delay: Duration,
    multiplier: f64,
    max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            multiplier: config.multiplier.max(1.0),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// Delay before retry number `retry_count` (1-based)
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(32) as i32;
        let millis = self.base_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// True once `retry_count` failures exceed the budget
    pub fn exhausted(&self, retry_count: u32) -> bool {
        retry_count > self.max_retries
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for(40), Duration::from_secs(300));
    }

    #[test]
    fn test_exhaustion() {
        let policy = RetryPolicy::default();
        assert!(!policy.exhausted(3));
        assert!(policy.exhausted(4));
    }

    #[test]
    fn test_classify_messages() {
        assert_eq!(classify_message("PDF is corrupt: bad xref"), ErrorClass::Content);
        assert_eq!(classify_message("File is password protected"), ErrorClass::Content);
        assert_eq!(classify_message("upstream returned 503"), ErrorClass::Transient);
        assert_eq!(classify_message("Connection refused (os error 111)"), ErrorClass::Transient);
        // an infrastructure cause is not blamed on the file
        assert_eq!(classify_message("timed out reading truncated stream"), ErrorClass::Transient);
        assert_eq!(classify_message("something odd"), ErrorClass::Transient);
    }

    #[test]
    fn test_transient_message_needs_a_known_cause() {
        assert!(is_transient_message("Service Unavailable"));
        assert!(!is_transient_message("something odd"));
        assert!(!is_transient_message(""));
    }

    #[test]
    fn test_retryable_classes() {
        assert!(ErrorClass::Transient.is_retryable());
        assert!(ErrorClass::WorkerCrash.is_retryable());
        assert!(!ErrorClass::Content.is_retryable());
        assert!(!ErrorClass::Quarantined.is_retryable());
    }
}
