//! Live job registry shared by intake, dispatcher and coordinator

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::retry::{ErrorClass, RetryRecord};
use crate::types::{
    AtomicJobState, Job, JobId, JobState, PathMode, ProcessingCategory, ProcessingResult,
    ResultSlot,
};

/// Per-path progress flags
#[derive(Debug, Default)]
struct PathFlags {
    claimed: AtomicBool,
    done: AtomicBool,
}

/// A job plus its concurrently mutated runtime state
#[derive(Debug)]
pub struct TrackedJob {
    job: RwLock<Job>,
    state: AtomicJobState,
    fast: PathFlags,
    deep: PathFlags,
    deep_scheduled: AtomicBool,
    cancelled: AtomicBool,
    result: ResultSlot,
    history: Mutex<Vec<RetryRecord>>,
}

impl TrackedJob {
    pub fn new(job: Job) -> Self {
        Self::with_state(job, JobState::Queued, ResultSlot::new())
    }

    /// Rebuild a job loaded from storage
    pub fn with_state(job: Job, state: JobState, result: ResultSlot) -> Self {
        Self {
            job: RwLock::new(job),
            state: AtomicJobState::new(state),
            fast: PathFlags::default(),
            deep: PathFlags::default(),
            deep_scheduled: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            result,
            history: Mutex::new(Vec::new()),
        }
    }

    /// Carry over the attempts recorded before a restart
    pub fn with_history(self, history: Vec<RetryRecord>) -> Self {
        *self.history.lock() = history;
        self
    }

    pub fn id(&self) -> JobId {
        self.job.read().id.clone()
    }

    /// Copy of the job record
    pub fn snapshot(&self) -> Job {
        self.job.read().clone()
    }

    pub fn category(&self) -> ProcessingCategory {
        self.job.read().category()
    }

    pub fn requires(&self, mode: PathMode) -> bool {
        self.job.read().paths.includes(mode)
    }

    pub fn state(&self) -> JobState {
        self.state.load()
    }

    pub fn state_cell(&self) -> &AtomicJobState {
        &self.state
    }

    pub fn result(&self) -> &ResultSlot {
        &self.result
    }

    fn flags(&self, mode: PathMode) -> &PathFlags {
        match mode {
            PathMode::Fast => &self.fast,
            PathMode::Deep => &self.deep,
        }
    }

    /// Claim a path for one in-flight attempt. Fails while another attempt holds it.
    pub fn claim_path(&self, mode: PathMode) -> bool {
        self.flags(mode)
            .claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Give a claimed path back without finishing it (retry, deferral)
    pub fn release_path(&self, mode: PathMode) {
        self.flags(mode).claimed.store(false, Ordering::Release);
    }

    pub fn is_path_claimed(&self, mode: PathMode) -> bool {
        self.flags(mode).claimed.load(Ordering::Acquire)
    }

    pub fn mark_path_done(&self, mode: PathMode) {
        let flags = self.flags(mode);
        flags.done.store(true, Ordering::Release);
        flags.claimed.store(false, Ordering::Release);
    }

    pub fn is_path_done(&self, mode: PathMode) -> bool {
        self.flags(mode).done.load(Ordering::Acquire)
    }

    /// Mark the deep pass scheduled; true only for the first caller
    pub fn schedule_deep_once(&self) -> bool {
        self.deep_scheduled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Stamp the start of an attempt
    pub fn begin_attempt(&self, category: ProcessingCategory) {
        let mut job = self.job.write();
        job.last_attempt_at = Some(Utc::now());
        job.worker_category = Some(category);
    }

    /// Record a failed attempt and return the new retry count.
    /// Content failures are recorded without consuming the retry budget.
    pub fn record_failure(&self, mode: PathMode, class: ErrorClass, message: impl Into<String>) -> u32 {
        let retry_count = {
            let mut job = self.job.write();
            if class.is_retryable() {
                job.retry_count += 1;
            }
            job.retry_count
        };
        self.history.lock().push(RetryRecord {
            attempt: retry_count,
            path: mode,
            class,
            message: message.into(),
            at: Utc::now(),
        });
        retry_count
    }

    pub fn retry_count(&self) -> u32 {
        self.job.read().retry_count
    }

    pub fn history(&self) -> Vec<RetryRecord> {
        self.history.lock().clone()
    }

    /// Currently visible result
    pub fn published(&self) -> Option<Arc<ProcessingResult>> {
        self.result.current()
    }
}

/// Concurrent map of live jobs
#[derive(Debug, Default)]
pub struct JobTable {
    jobs: DashMap<JobId, Arc<TrackedJob>>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert unless a job with the same id exists; returns the job that is tracked
    pub fn insert_if_absent(&self, job: TrackedJob) -> (Arc<TrackedJob>, bool) {
        let id = job.id();
        let mut inserted = false;
        let entry = self.jobs.entry(id).or_insert_with(|| {
            inserted = true;
            Arc::new(job)
        });
        (Arc::clone(entry.value()), inserted)
    }

    pub fn get(&self, id: &JobId) -> Option<Arc<TrackedJob>> {
        self.jobs.get(id).map(|j| Arc::clone(j.value()))
    }

    pub fn remove(&self, id: &JobId) -> Option<Arc<TrackedJob>> {
        self.jobs.remove(id).map(|(_, job)| job)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Number of jobs per lifecycle state
    pub fn count_by_state(&self) -> Vec<(JobState, usize)> {
        let mut counts: Vec<(JobState, usize)> = Vec::new();
        for job in self.jobs.iter() {
            let state = job.state();
            match counts.iter_mut().find(|(s, _)| *s == state) {
                Some((_, n)) => *n += 1,
                None => counts.push((state, 1)),
            }
        }
        counts.sort_by_key(|(s, _)| *s as u8);
        counts
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::detection::{Confidence, Detection};
    use crate::types::{QueueTier, RequiredPaths};
    use std::path::PathBuf;

    /// Minimal job for unit tests
    pub fn job(tag: &str, category: ProcessingCategory, tier: QueueTier, paths: RequiredPaths) -> Job {
        Job {
            id: JobId::for_bytes(tag.as_bytes()),
            source_path: PathBuf::from(format!("/tmp/{}.bin", tag)),
            file_name: format!("{}.bin", tag),
            size_bytes: tag.len() as u64,
            modified_at: Utc::now(),
            detection: Detection {
                mime: "application/pdf".to_string(),
                subtype: "pdf".to_string(),
                confidence: Confidence::Magic,
                category,
            },
            paths,
            score: 50,
            tier,
            retry_count: 0,
            enqueued_at: Utc::now(),
            last_attempt_at: None,
            worker_category: None,
        }
    }
}
