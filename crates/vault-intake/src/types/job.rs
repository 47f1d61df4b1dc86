//! Job identity, lifecycle state and processing paths

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};

use super::category::{ProcessingCategory, QueueTier};
use crate::detection::Detection;

/// Content-addressed job identifier (hex SHA-256 of the file bytes)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Build an identifier from a finished content digest
    pub fn from_digest(hasher: Sha256) -> Self {
        Self(hex::encode(hasher.finalize()))
    }

    /// Identifier for an in-memory byte buffer
    pub fn for_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self::from_digest(hasher)
    }

    /// Wrap an identifier received from outside (HTTP path, database row)
    pub fn parse(raw: &str) -> Option<Self> {
        let valid = raw.len() == 64 && raw.bytes().all(|b| b.is_ascii_hexdigit());
        valid.then(|| Self(raw.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First twelve hex digits, for log lines
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which extraction pass a unit of work belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathMode {
    /// Immediate low-fidelity pass
    Fast,
    /// Background high-fidelity pass
    Deep,
}

impl fmt::Display for PathMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathMode::Fast => f.write_str("fast"),
            PathMode::Deep => f.write_str("deep"),
        }
    }
}

/// Processing paths a job requires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequiredPaths {
    Fast,
    Deep,
    Both,
}

impl RequiredPaths {
    pub fn includes(self, mode: PathMode) -> bool {
        matches!(
            (self, mode),
            (RequiredPaths::Both, _)
                | (RequiredPaths::Fast, PathMode::Fast)
                | (RequiredPaths::Deep, PathMode::Deep)
        )
    }
}

/// Job lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum JobState {
    Queued = 0,
    ProcessingFast = 1,
    FastComplete = 2,
    ProcessingDeep = 3,
    Merged = 4,
    Archived = 5,
    DeadLettered = 6,
    Cancelled = 7,
}

impl JobState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Queued,
            1 => Self::ProcessingFast,
            2 => Self::FastComplete,
            3 => Self::ProcessingDeep,
            4 => Self::Merged,
            5 => Self::Archived,
            6 => Self::DeadLettered,
            _ => Self::Cancelled,
        }
    }

    /// No further transitions happen from a terminal state
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Archived | Self::DeadLettered | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::ProcessingFast => "processing-fast",
            Self::FastComplete => "fast-complete",
            Self::ProcessingDeep => "processing-deep",
            Self::Merged => "merged",
            Self::Archived => "archived",
            Self::DeadLettered => "dead-lettered",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        (0..=7u8).map(Self::from_u8).find(|s| s.as_str() == raw)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lock-free job state cell; every transition is a compare-and-swap
#[derive(Debug)]
pub struct AtomicJobState(AtomicU8);

impl AtomicJobState {
    pub fn new(state: JobState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> JobState {
        JobState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move from `from` to `to`; fails if another writer got there first
    pub fn transition(&self, from: JobState, to: JobState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Apply `f` in a CAS loop. `f` returns `None` to leave the state alone.
    /// Returns the state observed before the successful swap.
    pub fn update<F>(&self, mut f: F) -> Result<JobState, JobState>
    where
        F: FnMut(JobState) -> Option<JobState>,
    {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                f(JobState::from_u8(raw)).map(|s| s as u8)
            })
            .map(JobState::from_u8)
            .map_err(JobState::from_u8)
    }
}

/// The unit of work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Never changes once assigned
    pub id: JobId,
    pub source_path: PathBuf,
    pub file_name: String,
    pub size_bytes: u64,
    pub modified_at: DateTime<Utc>,
    pub detection: Detection,
    pub paths: RequiredPaths,
    /// 0..=100
    pub score: u8,
    pub tier: QueueTier,
    pub retry_count: u32,
    pub enqueued_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub worker_category: Option<ProcessingCategory>,
}

impl Job {
    pub fn category(&self) -> ProcessingCategory {
        self.detection.category
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_id_is_content_addressed() {
        let a = JobId::for_bytes(b"%PDF-1.7 same bytes");
        let b = JobId::for_bytes(b"%PDF-1.7 same bytes");
        let c = JobId::for_bytes(b"%PDF-1.7 other bytes");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn test_job_id_parse_rejects_garbage() {
        let id = JobId::for_bytes(b"x");
        assert_eq!(JobId::parse(id.as_str()), Some(id.clone()));
        assert_eq!(JobId::parse(&id.as_str().to_uppercase()), Some(id));
        assert!(JobId::parse("../etc/passwd").is_none());
    }

    #[test]
    fn test_state_transition_is_compare_and_swap() {
        let state = AtomicJobState::new(JobState::Queued);
        assert!(state.transition(JobState::Queued, JobState::ProcessingFast));
        // second claimant loses
        assert!(!state.transition(JobState::Queued, JobState::ProcessingFast));
        assert_eq!(state.load(), JobState::ProcessingFast);
    }

    #[test]
    fn test_state_update_leaves_terminal_alone() {
        let state = AtomicJobState::new(JobState::Archived);
        let result = state.update(|s| (!s.is_terminal()).then_some(JobState::DeadLettered));
        assert_eq!(result, Err(JobState::Archived));
        assert_eq!(state.load(), JobState::Archived);
    }

    #[test]
    fn test_state_names() {
        assert_eq!(JobState::ProcessingFast.as_str(), "processing-fast");
        assert_eq!(JobState::parse("dead-lettered"), Some(JobState::DeadLettered));
        assert_eq!(JobState::parse("nope"), None);
    }

    #[test]
    fn test_required_paths() {
        assert!(RequiredPaths::Both.includes(PathMode::Deep));
        assert!(RequiredPaths::Fast.includes(PathMode::Fast));
        assert!(!RequiredPaths::Fast.includes(PathMode::Deep));
        assert!(!RequiredPaths::Deep.includes(PathMode::Fast));
    }
}
