//! Intake pipeline: submission, status, statistics and dead-letter review
//!
//! `IntakePipeline` owns every piece of shared state (queue, job table,
//! breakers, dead letters) and hands it to the dispatcher and coordinator at
//! construction. Nothing is reached through globals, so tests build isolated
//! pipelines side by side.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

use crate::config::IntakeConfig;
use crate::detection::{Detection, DetectionOutcome, Detector, UnknownReason};
use crate::error::{Error, Result};
use crate::processing::scoring::clamp_override;
use crate::processing::{
    BreakerRegistry, BreakerSnapshot, DeadLetterEntry, DeadLetterStore, Dispatcher,
    DualPathCoordinator, ErrorClass, JobQueue, JobTable, PriorityScorer, QueueDepth,
    RetryPolicy, RetryRecord, ScoreInput, TrackedJob, WorkerStats,
};
use crate::providers::{publish, BackendRegistry, Publisher};
use crate::storage::{JobStore, StoredJob};
use crate::types::{
    Job, JobId, JobState, PathMode, ProcessingCategory, ProcessingResult, QueueTier,
    RequiredPaths, ResultSlot,
};

const HASH_BUFFER: usize = 64 * 1024;

/// A request to process one file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub path: PathBuf,
    /// MIME type or extension claimed by the caller; used only when no signature matches
    #[serde(default)]
    pub declared_type: Option<String>,
    /// Replaces the computed score (clamped to 0..=100)
    #[serde(default)]
    pub priority_override: Option<i64>,
    /// Paths to run; defaults from size and category
    #[serde(default)]
    pub paths: Option<RequiredPaths>,
    /// Run the deep path even for fast-only categories
    #[serde(default)]
    pub force_deep: bool,
}

impl SubmitRequest {
    pub fn for_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }
}

/// Outcome of a submission
#[derive(Debug, Clone, Serialize)]
pub struct SubmitReceipt {
    pub job_id: JobId,
    pub state: JobState,
    pub category: ProcessingCategory,
    pub tier: QueueTier,
    pub score: u8,
    /// The content was already known; the existing job id is returned
    pub duplicate: bool,
}

impl SubmitReceipt {
    fn for_job(job: &Job, state: JobState, duplicate: bool) -> Self {
        Self {
            job_id: job.id.clone(),
            state,
            category: job.category(),
            tier: job.tier,
            score: job.score,
            duplicate,
        }
    }
}

/// Result of a directory submission
#[derive(Debug, Clone, Serialize, Default)]
pub struct BatchReceipt {
    pub submitted: Vec<SubmitReceipt>,
    pub failed: Vec<BatchFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchFailure {
    pub path: PathBuf,
    pub error: String,
}

/// Externally visible job status
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub job: Job,
    pub state: JobState,
    /// The result downstream consumers currently see
    pub result: Option<Arc<ProcessingResult>>,
    pub fast_result: Option<Arc<ProcessingResult>>,
    pub deep_result: Option<Arc<ProcessingResult>>,
    pub result_version: u64,
    pub retry_history: Vec<RetryRecord>,
    pub dead_letter: Option<DeadLetterEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StateCount {
    pub state: JobState,
    pub count: usize,
}

/// Operational snapshot
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub queue: QueueDepth,
    pub workers: Vec<WorkerStats>,
    pub breakers: Vec<BreakerSnapshot>,
    pub jobs: Vec<StateCount>,
    pub dead_letters: usize,
    pub generated_at: DateTime<Utc>,
}

/// What intake learns about a file before any job exists
struct FileProbe {
    id: JobId,
    file_name: String,
    size_bytes: u64,
    modified_at: DateTime<Utc>,
    outcome: DetectionOutcome,
}

fn probe_file(detector: &Detector, path: &Path, declared_type: Option<&str>) -> Result<FileProbe> {
    let display = path.display().to_string();
    let metadata = std::fs::metadata(path).map_err(|e| Error::detection(&display, e.to_string()))?;
    if !metadata.is_file() {
        return Err(Error::InvalidRequest(format!("{} is not a regular file", display)));
    }

    let mut file = File::open(path).map_err(|e| Error::detection(&display, e.to_string()))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUFFER];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| Error::detection(&display, e.to_string()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    let outcome = detector.detect_path(path, declared_type)?;
    let modified_at = metadata
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());

    Ok(FileProbe {
        id: JobId::from_digest(hasher),
        file_name: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        size_bytes: metadata.len(),
        modified_at,
        outcome,
    })
}

/// The intake, triage and dispatch core
pub struct IntakePipeline {
    config: IntakeConfig,
    detector: Detector,
    scorer: PriorityScorer,
    retry: RetryPolicy,
    queue: Arc<JobQueue>,
    jobs: Arc<JobTable>,
    breakers: Arc<BreakerRegistry>,
    dead_letters: Arc<DeadLetterStore>,
    coordinator: Arc<DualPathCoordinator>,
    dispatcher: Arc<Dispatcher>,
    database: Option<Arc<JobStore>>,
}

impl IntakePipeline {
    /// Build from configuration: SQLite store, HTTP backends and publisher
    pub fn new(config: IntakeConfig) -> Result<Self> {
        config.validate()?;
        let database = if config.storage.enabled {
            let path = config.storage.resolved_path();
            tracing::info!("Job store at {}", path.display());
            Some(Arc::new(JobStore::new(&path)?))
        } else {
            tracing::info!("Persistence disabled, jobs are kept in memory only");
            None
        };
        let backends = BackendRegistry::from_config(&config.backends);
        let publisher = publish::from_config(&config.publish);
        Ok(Self::with_components(config, database, backends, publisher))
    }

    /// Build with explicit collaborators
    pub fn with_components(
        config: IntakeConfig,
        database: Option<Arc<JobStore>>,
        backends: BackendRegistry,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        let queue = Arc::new(JobQueue::new(&config.queue));
        let jobs = Arc::new(JobTable::new());
        let breakers = Arc::new(BreakerRegistry::new(config.breaker.clone()));
        let dead_letters = Arc::new(DeadLetterStore::new(database.clone()));
        let retry = RetryPolicy::new(&config.retry);

        let coordinator = Arc::new(DualPathCoordinator::new(
            Arc::new(backends),
            Arc::clone(&breakers),
            publisher,
            Arc::clone(&queue),
            database.clone(),
            config.coordinator.clone(),
        ));
        let dispatcher = Dispatcher::new(
            &config.dispatcher,
            &config.queue,
            retry.clone(),
            Arc::clone(&queue),
            Arc::clone(&jobs),
            Arc::clone(&coordinator),
            Arc::clone(&dead_letters),
        );

        Self {
            detector: Detector::new(&config.detection),
            scorer: PriorityScorer::new(config.scoring.clone()),
            config,
            retry,
            queue,
            jobs,
            breakers,
            dead_letters,
            coordinator,
            dispatcher,
            database,
        }
    }

    /// Recover persisted work and start dispatching
    pub fn start(&self) -> Result<usize> {
        let recovered = self.recover()?;
        self.dispatcher.start();
        Ok(recovered)
    }

    pub async fn shutdown(&self) {
        self.dispatcher.shutdown().await;
    }

    /// Re-enqueue jobs a previous process left unfinished and reload dead letters
    pub fn recover(&self) -> Result<usize> {
        let Some(db) = &self.database else {
            return Ok(0);
        };

        let dead = self.dead_letters.load()?;
        let mut requeued = 0;

        for StoredJob { job, result, result_version, retry_history, .. } in db.incomplete_jobs()? {
            let slot = match result {
                Some(result) => ResultSlot::restored(result, result_version),
                None => ResultSlot::new(),
            };
            let visible_path = slot.current().map(|r| r.path);
            let (tracked, inserted) = self
                .jobs
                .insert_if_absent(
                    TrackedJob::with_state(job, JobState::Queued, slot).with_history(retry_history),
                );
            if !inserted {
                continue;
            }

            match visible_path {
                Some(PathMode::Deep) => tracked.mark_path_done(PathMode::Deep),
                Some(PathMode::Fast) => tracked.mark_path_done(PathMode::Fast),
                None => {}
            }
            let state = self.coordinator.settle(&tracked);
            self.persist(&tracked);
            if state.is_terminal() {
                continue;
            }

            let snapshot = tracked.snapshot();
            if tracked.requires(PathMode::Fast) && !tracked.is_path_done(PathMode::Fast) {
                self.queue.enqueue(snapshot.id.clone(), snapshot.category(), snapshot.tier);
            } else if tracked.requires(PathMode::Deep) && tracked.schedule_deep_once() {
                self.queue.enqueue_deep(snapshot.id.clone(), snapshot.category());
            }
            requeued += 1;
        }

        tracing::info!(
            "Recovered {} unfinished jobs and {} dead letters",
            requeued,
            dead
        );
        Ok(requeued)
    }

    /// Submit one file. Identical content always yields the same job id.
    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitReceipt> {
        let detector = self.detector.clone();
        let path = request.path.clone();
        let declared = request.declared_type.clone();
        let probe = tokio::task::spawn_blocking(move || {
            probe_file(&detector, &path, declared.as_deref())
        })
        .await
        .map_err(|e| Error::internal(format!("Task join error: {}", e)))??;

        self.admit(request, probe).await
    }

    /// Submit, retrying transient detection failures with backoff
    pub async fn submit_with_retry(&self, request: SubmitRequest) -> Result<SubmitReceipt> {
        let mut attempt = 0;
        loop {
            match self.submit(request.clone()).await {
                Err(e) if e.is_transient() && attempt < self.retry.max_retries => {
                    attempt += 1;
                    let delay = self.retry.delay_for(attempt);
                    tracing::warn!(
                        "Detection of {} failed, retrying in {:?} ({}/{}): {}",
                        request.path.display(),
                        delay,
                        attempt,
                        self.retry.max_retries,
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    /// Submit every regular file under `root`
    pub async fn submit_directory(&self, root: &Path, recursive: bool) -> Result<BatchReceipt> {
        if !root.is_dir() {
            return Err(Error::InvalidRequest(format!(
                "{} is not a directory",
                root.display()
            )));
        }

        let walk_root = root.to_path_buf();
        let files: Vec<PathBuf> = tokio::task::spawn_blocking(move || {
            let walker = WalkDir::new(&walk_root).follow_links(false);
            let walker = if recursive { walker } else { walker.max_depth(1) };
            walker
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .map(|e| e.into_path())
                .collect()
        })
        .await
        .map_err(|e| Error::internal(format!("Task join error: {}", e)))?;

        tracing::info!("Submitting {} files from {}", files.len(), root.display());

        let mut receipt = BatchReceipt::default();
        for path in files {
            match self.submit_with_retry(SubmitRequest::for_path(&path)).await {
                Ok(r) => receipt.submitted.push(r),
                Err(e) => {
                    tracing::warn!("Skipping {}: {}", path.display(), e);
                    receipt.failed.push(BatchFailure {
                        path,
                        error: e.to_string(),
                    });
                }
            }
        }
        Ok(receipt)
    }

    /// Detect a file without enqueuing it
    pub async fn detect(&self, path: &Path, declared_type: Option<&str>) -> Result<DetectionOutcome> {
        let detector = self.detector.clone();
        let path = path.to_path_buf();
        let declared = declared_type.map(str::to_string);
        tokio::task::spawn_blocking(move || detector.detect_path(&path, declared.as_deref()))
            .await
            .map_err(|e| Error::internal(format!("Task join error: {}", e)))?
    }

    async fn admit(&self, request: SubmitRequest, probe: FileProbe) -> Result<SubmitReceipt> {
        if let Some(duplicate) = self.existing(&probe.id) {
            return Ok(duplicate);
        }

        let now = Utc::now();
        let mut job = Job {
            id: probe.id,
            source_path: request.path.clone(),
            file_name: probe.file_name,
            size_bytes: probe.size_bytes,
            modified_at: probe.modified_at,
            detection: Detection::unknown(),
            paths: RequiredPaths::Fast,
            score: 0,
            tier: QueueTier::Bulk,
            retry_count: 0,
            enqueued_at: now,
            last_attempt_at: None,
            worker_category: None,
        };

        let detection = match probe.outcome {
            DetectionOutcome::Detected(detection) => detection,
            DetectionOutcome::Unknown { reason } => return Ok(self.quarantine(job, reason).await),
        };

        let input = ScoreInput {
            modified_at: job.modified_at,
            category: detection.category,
            subtype: &detection.subtype,
            file_name: &job.file_name,
            size_bytes: job.size_bytes,
        };
        let score = match request.priority_override {
            Some(value) => clamp_override(value),
            None => self.scorer.score(&input, now),
        };
        let paths = request.paths.unwrap_or_else(|| {
            if self.scorer.routes_deep_only(&input) {
                RequiredPaths::Deep
            } else if request.force_deep
                || !self.config.coordinator.fast_only.contains(&detection.category)
            {
                RequiredPaths::Both
            } else {
                RequiredPaths::Fast
            }
        });
        job.tier = self.scorer.tier_for(score);
        job.score = score;
        job.paths = paths;
        job.detection = detection;

        let (tracked, inserted) = self.jobs.insert_if_absent(TrackedJob::new(job));
        let snapshot = tracked.snapshot();
        if !inserted {
            return Ok(SubmitReceipt::for_job(&snapshot, tracked.state(), true));
        }
        self.coordinator.persist(&tracked, false).await;

        if snapshot.paths == RequiredPaths::Deep {
            tracked.schedule_deep_once();
            self.queue.enqueue_deep(snapshot.id.clone(), snapshot.category());
        } else {
            self.queue.enqueue(snapshot.id.clone(), snapshot.category(), snapshot.tier);
        }

        tracing::info!(
            "Queued {} as {} ({}, {:?} confidence), score {} -> {} tier",
            snapshot.file_name,
            snapshot.id.short(),
            snapshot.detection.subtype,
            snapshot.detection.confidence,
            snapshot.score,
            snapshot.tier
        );

        Ok(SubmitReceipt::for_job(&snapshot, JobState::Queued, false))
    }

    /// Receipt for content the pipeline already knows, unless it was cancelled
    fn existing(&self, id: &JobId) -> Option<SubmitReceipt> {
        if let Some(tracked) = self.jobs.get(id) {
            if tracked.state() != JobState::Cancelled {
                return Some(SubmitReceipt::for_job(&tracked.snapshot(), tracked.state(), true));
            }
            self.jobs.remove(id);
            return None;
        }
        if let Some(entry) = self.dead_letters.get(id) {
            return Some(SubmitReceipt::for_job(&entry.job, JobState::DeadLettered, true));
        }
        let db = self.database.as_ref()?;
        match db.get_job(id) {
            Ok(Some(stored)) if stored.state != JobState::Cancelled => {
                Some(SubmitReceipt::for_job(&stored.job, stored.state, true))
            }
            Ok(_) => None,
            Err(e) => {
                tracing::warn!("Duplicate lookup for {} failed: {}", id.short(), e);
                None
            }
        }
    }

    /// Zero-byte and truncated files bypass the queues
    async fn quarantine(&self, job: Job, reason: UnknownReason) -> SubmitReceipt {
        let message = match reason {
            UnknownReason::Empty => "empty file".to_string(),
            UnknownReason::Truncated(detail) => format!("truncated file: {}", detail),
        };
        let (tracked, inserted) = self.jobs.insert_if_absent(TrackedJob::new(job));
        if inserted {
            tracked.record_failure(PathMode::Fast, ErrorClass::Quarantined, message.clone());
            self.dead_letters.admit(&tracked, ErrorClass::Quarantined, message).await;
        }
        SubmitReceipt::for_job(&tracked.snapshot(), tracked.state(), !inserted)
    }

    /// Current state, results and retry history
    pub fn status(&self, id: &JobId) -> Result<JobStatus> {
        if let Some(tracked) = self.jobs.get(id) {
            let slot = tracked.result();
            let visible = slot.current();
            let (fast_result, deep_result) = split_results(visible.clone(), slot.replaced_fast());
            return Ok(JobStatus {
                job: tracked.snapshot(),
                state: tracked.state(),
                result: visible,
                fast_result,
                deep_result,
                result_version: slot.version(),
                retry_history: tracked.history(),
                dead_letter: self.dead_letters.get(id),
            });
        }

        let dead_letter = self.dead_letters.get(id);
        let stored = match &self.database {
            Some(db) => db.get_job(id)?,
            None => None,
        };
        match (stored, dead_letter) {
            (Some(stored), dead_letter) => {
                let visible = stored.result.map(Arc::new);
                let (fast_result, deep_result) = split_results(visible.clone(), None);
                Ok(JobStatus {
                    job: stored.job,
                    state: stored.state,
                    result: visible,
                    fast_result,
                    deep_result,
                    result_version: stored.result_version,
                    retry_history: match &dead_letter {
                        Some(entry) => entry.retry_history.clone(),
                        None => stored.retry_history,
                    },
                    dead_letter,
                })
            }
            (None, Some(entry)) => Ok(JobStatus {
                job: entry.job.clone(),
                state: JobState::DeadLettered,
                result: None,
                fast_result: None,
                deep_result: None,
                result_version: 0,
                retry_history: entry.retry_history.clone(),
                dead_letter: Some(entry),
            }),
            (None, None) => Err(Error::JobNotFound(id.to_string())),
        }
    }

    /// Cancel a job. Queued entries are removed; in-flight results are discarded.
    pub fn cancel(&self, id: &JobId) -> Result<JobState> {
        let tracked = self
            .jobs
            .get(id)
            .ok_or_else(|| Error::JobNotFound(id.to_string()))?;
        if tracked.state().is_terminal() {
            return Ok(tracked.state());
        }

        tracked.cancel();
        let removed = self.queue.remove_job(id, tracked.category());
        let in_flight = tracked.is_path_claimed(PathMode::Fast) || tracked.is_path_claimed(PathMode::Deep);
        if !in_flight
            && tracked
                .state_cell()
                .update(|s| (!s.is_terminal()).then_some(JobState::Cancelled))
                .is_ok()
        {
            self.persist(&tracked);
        }

        tracing::info!(
            "Cancelled {} ({} queued entries removed, in flight: {})",
            id.short(),
            removed,
            in_flight
        );
        Ok(tracked.state())
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            queue: self.queue.depth(),
            workers: self.dispatcher.worker_stats(),
            breakers: self.breakers.snapshot(),
            jobs: self
                .jobs
                .count_by_state()
                .into_iter()
                .map(|(state, count)| StateCount { state, count })
                .collect(),
            dead_letters: self.dead_letters.len(),
            generated_at: Utc::now(),
        }
    }

    pub fn dead_letters(&self) -> Vec<DeadLetterEntry> {
        self.dead_letters.list()
    }

    pub fn dead_letter(&self, id: &JobId) -> Result<DeadLetterEntry> {
        self.dead_letters
            .get(id)
            .ok_or_else(|| Error::DeadLetterNotFound(id.to_string()))
    }

    /// Explicit resubmission of a dead letter with a fresh retry budget.
    /// Quarantined files are re-read from disk since they may have been completed since.
    pub async fn resubmit(&self, id: &JobId) -> Result<SubmitReceipt> {
        let entry = self
            .dead_letters
            .take(id)
            .ok_or_else(|| Error::DeadLetterNotFound(id.to_string()))?;
        self.jobs.remove(id);
        if let Some(db) = &self.database {
            db.delete_job(id)?;
        }

        tracing::info!("Resubmitting dead letter {} ({})", id.short(), entry.error_class);

        if entry.error_class == ErrorClass::Quarantined {
            return self.submit(SubmitRequest::for_path(&entry.job.source_path)).await;
        }

        let mut job = entry.job;
        job.retry_count = 0;
        job.enqueued_at = Utc::now();
        job.last_attempt_at = None;
        job.worker_category = None;

        let (tracked, _) = self.jobs.insert_if_absent(TrackedJob::new(job));
        let snapshot = tracked.snapshot();
        self.coordinator.persist(&tracked, false).await;
        if snapshot.paths == RequiredPaths::Deep {
            tracked.schedule_deep_once();
            self.queue.enqueue_deep(snapshot.id.clone(), snapshot.category());
        } else {
            self.queue.enqueue(snapshot.id.clone(), snapshot.category(), snapshot.tier);
        }
        Ok(SubmitReceipt::for_job(&snapshot, tracked.state(), false))
    }

    fn persist(&self, tracked: &TrackedJob) {
        let Some(db) = &self.database else {
            return;
        };
        let snapshot = tracked.snapshot();
        let result = tracked.result().current();
        let version = tracked.result().version();
        let history = tracked.history();
        if let Err(e) = db.upsert_job(
            &snapshot,
            tracked.state(),
            result.as_deref().map(|r| (r, version)),
            &history,
        ) {
            tracing::error!("Failed to persist job {}: {}", snapshot.id.short(), e);
        }
    }
}

fn split_results(
    visible: Option<Arc<ProcessingResult>>,
    replaced_fast: Option<Arc<ProcessingResult>>,
) -> (Option<Arc<ProcessingResult>>, Option<Arc<ProcessingResult>>) {
    match visible {
        Some(r) if r.path == PathMode::Deep => (replaced_fast, Some(r)),
        Some(r) => (Some(r), None),
        None => (None, None),
    }
}
