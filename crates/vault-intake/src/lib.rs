//! vault-intake: intake, triage and dispatch core for a document-processing pipeline
//!
//! Files are detected by content, scored, queued per category and tier, and
//! dispatched to extraction backends along a fast path and a deep path. Failing
//! backends are isolated by circuit breakers; jobs that cannot succeed end up in
//! a dead-letter store for review and explicit resubmission.

pub mod config;
pub mod detection;
pub mod error;
pub mod pipeline;
pub mod processing;
pub mod providers;
pub mod server;
pub mod storage;
pub mod types;

pub use config::IntakeConfig;
pub use detection::{Detection, DetectionOutcome, Detector};
pub use error::{Error, Result};
pub use pipeline::{IntakePipeline, JobStatus, SubmitReceipt, SubmitRequest};
pub use types::{Job, JobId, JobState, PathMode, ProcessingCategory, QueueTier};
