//! Core types for the intake pipeline

pub mod category;
pub mod job;
pub mod result;

pub use category::{ProcessingCategory, QueueTier};
pub use job::{AtomicJobState, Job, JobId, JobState, PathMode, RequiredPaths};
pub use result::{ProcessingResult, ResultSlot, SlotConflict};
