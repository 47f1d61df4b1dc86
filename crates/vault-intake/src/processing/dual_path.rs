//! Fast/deep processing coordinator
//!
//! A fast attempt schedules the job's deep pass on the background lane before
//! it calls its own backend, so deep work starts concurrently with (never
//! before) the fast pass. Both passes write into the job's `ResultSlot`; the
//! deep write always wins and a late fast write is dropped.
//!
//! The lifecycle state is derived from the per-path claim/done flags and
//! applied with compare-and-swap, so the two passes never need a shared lock.

use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::circuit_breaker::BreakerRegistry;
use super::job_queue::JobQueue;
use super::job_table::TrackedJob;
use crate::config::CoordinatorConfig;
use crate::providers::{
    BackendError, BackendRegistry, ContentHandle, PublishEvent, PublishKind, Publisher,
};
use crate::storage::JobStore;
use crate::types::{JobState, PathMode, ProcessingCategory, ProcessingResult, SlotConflict};

/// Wait before redelivering work whose path is still held by another attempt
const CLAIM_RETRY_DELAY: Duration = Duration::from_secs(1);

/// What the dispatcher should do with the lease after an attempt
#[derive(Debug)]
pub enum PathOutcome {
    /// Result committed
    Completed,
    /// Nothing to do: cancelled, terminal, or path already finished
    Discarded,
    /// Not attempted; redeliver after `delay` without consuming retry budget
    Deferred { delay: Duration },
    /// The backend call failed
    Failed(BackendError),
}

/// Runs one path of one job against its backend
pub struct DualPathCoordinator {
    backends: Arc<BackendRegistry>,
    breakers: Arc<BreakerRegistry>,
    publisher: Arc<dyn Publisher>,
    queue: Arc<JobQueue>,
    database: Option<Arc<JobStore>>,
    config: CoordinatorConfig,
}

impl DualPathCoordinator {
    pub fn new(
        backends: Arc<BackendRegistry>,
        breakers: Arc<BreakerRegistry>,
        publisher: Arc<dyn Publisher>,
        queue: Arc<JobQueue>,
        database: Option<Arc<JobStore>>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            backends,
            breakers,
            publisher,
            queue,
            database,
            config,
        }
    }

    /// Run `mode` for `job` on a worker of `worker` category
    pub async fn run(
        &self,
        job: &Arc<TrackedJob>,
        mode: PathMode,
        worker: ProcessingCategory,
    ) -> PathOutcome {
        if self.discard_if_finished(job).await {
            return PathOutcome::Discarded;
        }
        if !job.requires(mode) || job.is_path_done(mode) {
            return PathOutcome::Discarded;
        }
        if !job.claim_path(mode) {
            return PathOutcome::Deferred { delay: CLAIM_RETRY_DELAY };
        }

        job.begin_attempt(worker);
        self.settle(job);
        if mode == PathMode::Fast && job.requires(PathMode::Deep) && job.schedule_deep_once() {
            self.queue.enqueue_deep(job.id(), job.category());
        }
        self.persist(job, false).await;

        let backend = self.backends.resolve(job.category(), mode);
        let breaker = self.breakers.get(backend.id());
        let permit = match breaker.acquire() {
            Ok(permit) => permit,
            Err(rejected) => {
                tracing::debug!(
                    "Circuit for {} open, deferring {} pass of {} by {:?}",
                    backend.id(),
                    mode,
                    job.id().short(),
                    rejected.retry_after
                );
                job.release_path(mode);
                self.settle(job);
                return PathOutcome::Deferred { delay: rejected.retry_after };
            }
        };

        let handle = ContentHandle::from(&job.snapshot());
        let timeout = self.config.timeout_for(mode);
        let started = Instant::now();
        let outcome = match tokio::time::timeout(timeout, backend.extract(&handle, mode)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(BackendError::Timeout(timeout)),
        };
        match &outcome {
            Ok(_) => permit.succeeded(),
            Err(BackendError::Content { .. }) => permit.rejected_content(),
            Err(_) => permit.failed(),
        }

        // in-flight calls finish; their results are dropped
        if self.discard_if_finished(job).await {
            job.release_path(mode);
            return PathOutcome::Discarded;
        }

        match outcome {
            Ok(extraction) => {
                let result = ProcessingResult {
                    content: extraction.content,
                    confidence: extraction.confidence,
                    backend_id: backend.id().to_string(),
                    duration_ms: started.elapsed().as_millis() as u64,
                    path: mode,
                    produced_at: Utc::now(),
                };
                match mode {
                    PathMode::Fast => self.complete_fast(job, result).await,
                    PathMode::Deep => self.complete_deep(job, result).await,
                }
                PathOutcome::Completed
            }
            Err(err) => {
                tracing::warn!(
                    "{} pass of {} failed on {}: {}",
                    mode,
                    job.id().short(),
                    backend.id(),
                    err
                );
                job.release_path(mode);
                self.settle(job);
                PathOutcome::Failed(err)
            }
        }
    }

    async fn complete_fast(&self, job: &Arc<TrackedJob>, result: ProcessingResult) {
        let event_result = Arc::new(result.clone());
        match job.result().publish(result) {
            Ok(version) => {
                job.mark_path_done(PathMode::Fast);
                let state = self.settle(job);
                self.persist(job, true).await;
                tracing::info!("Fast result for {} visible (v{}), now {}", job.id().short(), version, state);
                self.notify(job, PublishKind::Fast, version, event_result).await;
            }
            Err(conflict) => {
                tracing::debug!(
                    "Fast result for {} dropped: {:?}",
                    job.id().short(),
                    conflict
                );
                job.mark_path_done(PathMode::Fast);
                self.settle(job);
                self.persist(job, false).await;
            }
        }
    }

    async fn complete_deep(&self, job: &Arc<TrackedJob>, result: ProcessingResult) {
        let event_result = Arc::new(result.clone());
        let version = match job.result().publish(result) {
            Ok(version) => version,
            Err(SlotConflict::Superseded) | Err(SlotConflict::Stale { .. }) => {
                // a deep write is never superseded; keep the visible result
                job.result().version()
            }
        };

        let _ = job
            .state_cell()
            .update(|s| (!s.is_terminal()).then_some(JobState::Merged));
        job.mark_path_done(PathMode::Deep);
        self.persist(job, true).await;
        self.notify(job, PublishKind::Merged, version, event_result).await;

        let state = self.settle(job);
        self.persist(job, false).await;
        tracing::info!("Deep result for {} merged (v{}), now {}", job.id().short(), version, state);
    }

    async fn notify(
        &self,
        job: &TrackedJob,
        kind: PublishKind,
        version: u64,
        result: Arc<ProcessingResult>,
    ) {
        let snapshot = job.snapshot();
        let event = PublishEvent {
            job_id: snapshot.id,
            source_path: snapshot.source_path,
            kind,
            version,
            result,
            published_at: Utc::now(),
        };
        if let Err(e) = self.publisher.publish(&event).await {
            tracing::error!(
                "Publishing {:?} result for {} via {} failed: {}",
                kind,
                event.job_id.short(),
                self.publisher.name(),
                e
            );
        }
    }

    /// Cancelled jobs move to `Cancelled`; true if the job needs no more work
    async fn discard_if_finished(&self, job: &TrackedJob) -> bool {
        if job.is_cancelled() {
            let moved = job
                .state_cell()
                .update(|s| (!s.is_terminal()).then_some(JobState::Cancelled));
            if moved.is_ok() {
                tracing::info!("Job {} cancelled", job.id().short());
                self.persist(job, false).await;
            }
            return true;
        }
        job.state().is_terminal()
    }

    /// State implied by the path flags
    fn target_state(job: &TrackedJob) -> JobState {
        let fast_done = job.is_path_done(PathMode::Fast);
        let deep_done = job.is_path_done(PathMode::Deep);
        if deep_done || (fast_done && !job.requires(PathMode::Deep)) {
            return JobState::Archived;
        }
        let deep_claimed = job.is_path_claimed(PathMode::Deep);
        if fast_done {
            return if deep_claimed { JobState::ProcessingDeep } else { JobState::FastComplete };
        }
        if job.is_path_claimed(PathMode::Fast) {
            return JobState::ProcessingFast;
        }
        if deep_claimed {
            return JobState::ProcessingDeep;
        }
        JobState::Queued
    }

    /// Move the job to the state its flags imply; terminal states are final
    pub(crate) fn settle(&self, job: &TrackedJob) -> JobState {
        loop {
            let target = Self::target_state(job);
            let moved = job
                .state_cell()
                .update(|s| (!s.is_terminal() && s != target).then_some(target));
            if moved.is_ok() && target == JobState::Archived {
                tracing::info!("Job {} archived", job.id().short());
            }
            let now = job.state();
            // flags may have changed while we were writing
            if now.is_terminal() || Self::target_state(job) == target {
                return now;
            }
        }
    }

    /// Write the job row on the blocking pool; failures are logged, not raised
    pub(crate) async fn persist(&self, job: &TrackedJob, with_result: bool) {
        let Some(db) = &self.database else {
            return;
        };
        let db = Arc::clone(db);
        let snapshot = job.snapshot();
        let state = job.state();
        let result = if with_result { job.result().current() } else { None };
        let version = job.result().version();
        let history = job.history();
        let id = snapshot.id.short().to_string();

        let written = tokio::task::spawn_blocking(move || {
            db.upsert_job(
                &snapshot,
                state,
                result.as_deref().map(|r| (r, version)),
                &history,
            )
        })
        .await;
        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("Failed to persist job {}: {}", id, e),
            Err(e) => tracing::error!("Persist task for job {} failed: {}", id, e),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::providers::{Extraction, ExtractionBackend};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Backend answering from a script, then succeeding
    pub struct ScriptedBackend {
        id: String,
        script: Mutex<VecDeque<Result<Extraction, BackendError>>>,
        delay: Option<Duration>,
        calls: AtomicUsize,
    }

    impl ScriptedBackend {
        pub fn new(id: &str) -> Self {
            Self {
                id: id.to_string(),
                script: Mutex::new(VecDeque::new()),
                delay: None,
                calls: AtomicUsize::new(0),
            }
        }

        pub fn then(self, outcome: Result<Extraction, BackendError>) -> Self {
            self.script.lock().push_back(outcome);
            self
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ExtractionBackend for ScriptedBackend {
        fn id(&self) -> &str {
            &self.id
        }

        async fn extract(
            &self,
            handle: &ContentHandle,
            mode: PathMode,
        ) -> Result<Extraction, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let scripted = self.script.lock().pop_front();
            scripted.unwrap_or_else(|| {
                Ok(Extraction {
                    content: format!("{} text of {}", mode, handle.file_name),
                    confidence: if mode == PathMode::Deep { 0.9 } else { 0.4 },
                })
            })
        }
    }
}
