//! Per-category worker pools
//!
//! Every category runs its own dispatch loop with its own slot semaphore, so a
//! saturated category never holds up another. An attempt owns one slot for its
//! whole duration; deep attempts additionally own one of the category's deep
//! slots, which are capped below the total so fresh intake keeps moving.
//!
//! Each attempt runs in its own task under a supervisor: a panic surfaces as a
//! `JoinError` and is retried like any transient failure.

use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

use super::dead_letter::DeadLetterStore;
use super::dual_path::{DualPathCoordinator, PathOutcome};
use super::job_queue::{JobQueue, Lease};
use super::job_table::{JobTable, TrackedJob};
use super::retry::{ErrorClass, RetryPolicy};
use crate::config::{DispatcherConfig, QueueConfig};
use crate::providers::BackendError;
use crate::types::ProcessingCategory;

/// Worker capacity of one category
struct WorkerPool {
    category: ProcessingCategory,
    slots: usize,
    deep_slots: usize,
    permits: Arc<Semaphore>,
    deep_permits: Arc<Semaphore>,
    active: AtomicUsize,
}

/// Observability view of one pool
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStats {
    pub category: ProcessingCategory,
    pub slots: usize,
    pub deep_slots: usize,
    pub active: usize,
    pub idle: usize,
    pub queued: usize,
}

/// Decrements the active count when an attempt ends, however it ends
struct ActiveGuard(Arc<WorkerPool>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Pulls leases from the queue and hands them to the coordinator
pub struct Dispatcher {
    queue: Arc<JobQueue>,
    jobs: Arc<JobTable>,
    coordinator: Arc<DualPathCoordinator>,
    dead_letters: Arc<DeadLetterStore>,
    retry: RetryPolicy,
    poll_interval: Duration,
    reaper_interval: Duration,
    pools: Vec<Arc<WorkerPool>>,
    shutdown: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(
        config: &DispatcherConfig,
        queue_config: &QueueConfig,
        retry: RetryPolicy,
        queue: Arc<JobQueue>,
        jobs: Arc<JobTable>,
        coordinator: Arc<DualPathCoordinator>,
        dead_letters: Arc<DeadLetterStore>,
    ) -> Arc<Self> {
        let pools = ProcessingCategory::ALL
            .iter()
            .map(|&category| {
                let slots = config.slots_for(category);
                let deep_slots = config.deep_slots_for(category);
                Arc::new(WorkerPool {
                    category,
                    slots,
                    deep_slots,
                    permits: Arc::new(Semaphore::new(slots)),
                    deep_permits: Arc::new(Semaphore::new(deep_slots)),
                    active: AtomicUsize::new(0),
                })
            })
            .collect();

        let (shutdown, _) = watch::channel(false);

        Arc::new(Self {
            queue,
            jobs,
            coordinator,
            dead_letters,
            retry,
            poll_interval: config.poll_interval(),
            reaper_interval: Duration::from_secs(queue_config.reaper_interval_secs.max(1)),
            pools,
            shutdown,
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Spawn one dispatch loop per category plus the lease reaper
    pub fn start(self: &Arc<Self>) {
        let mut handles = self.handles.lock();
        if !handles.is_empty() {
            return;
        }
        for pool in &self.pools {
            tracing::info!(
                "Dispatcher for {}: {} slots ({} deep)",
                pool.category,
                pool.slots,
                pool.deep_slots
            );
            let dispatcher = Arc::clone(self);
            let pool = Arc::clone(pool);
            let shutdown = self.shutdown.subscribe();
            handles.push(tokio::spawn(dispatcher.run_category(pool, shutdown)));
        }
        let dispatcher = Arc::clone(self);
        let shutdown = self.shutdown.subscribe();
        handles.push(tokio::spawn(dispatcher.run_reaper(shutdown)));
    }

    /// Stop taking new work; in-flight attempts run to completion
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for result in join_all(handles).await {
            if let Err(e) = result {
                tracing::warn!("Dispatch loop ended abnormally: {}", e);
            }
        }
        tracing::info!("Dispatcher stopped");
    }

    pub fn worker_stats(&self) -> Vec<WorkerStats> {
        self.pools
            .iter()
            .map(|pool| {
                let active = pool.active.load(Ordering::Acquire);
                WorkerStats {
                    category: pool.category,
                    slots: pool.slots,
                    deep_slots: pool.deep_slots,
                    active,
                    idle: pool.slots.saturating_sub(active),
                    queued: self.queue.depth_for(pool.category),
                }
            })
            .collect()
    }

    async fn run_category(
        self: Arc<Self>,
        pool: Arc<WorkerPool>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let category = pool.category;
        loop {
            if *shutdown.borrow() {
                break;
            }

            // a worker at capacity waits here, never on another category
            let permit = tokio::select! {
                permit = Arc::clone(&pool.permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.changed() => break,
            };

            let notified = self.queue.notified(category);

            if let Some(lease) = self.queue.dequeue(category) {
                self.spawn_attempt(&pool, lease, permit, None);
                continue;
            }
            if let Ok(deep_permit) = Arc::clone(&pool.deep_permits).try_acquire_owned() {
                if let Some(lease) = self.queue.dequeue_deep(category) {
                    self.spawn_attempt(&pool, lease, permit, Some(deep_permit));
                    continue;
                }
            }

            drop(permit);
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown.changed() => break,
            }
        }
        tracing::debug!("Dispatch loop for {} stopped", category);
    }

    async fn run_reaper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.reaper_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reaped = self.queue.reap_expired();
                    if reaped > 0 {
                        tracing::warn!("Redelivered {} expired leases", reaped);
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    fn spawn_attempt(
        self: &Arc<Self>,
        pool: &Arc<WorkerPool>,
        lease: Lease,
        permit: OwnedSemaphorePermit,
        deep_permit: Option<OwnedSemaphorePermit>,
    ) {
        pool.active.fetch_add(1, Ordering::AcqRel);
        let guard = ActiveGuard(Arc::clone(pool));
        let dispatcher = Arc::clone(self);
        let category = pool.category;

        tracing::debug!(
            "Dispatching {} pass of {} on {} (delivery {})",
            lease.path(),
            lease.entry.job_id.short(),
            category,
            lease.deliveries
        );

        tokio::spawn(async move {
            let _slots = (permit, deep_permit, guard);
            dispatcher.supervise(lease, category).await;
        });
    }

    async fn supervise(&self, lease: Lease, worker: ProcessingCategory) {
        let Some(job) = self.jobs.get(&lease.entry.job_id) else {
            // dropped from the table (cancelled and replaced)
            self.queue.ack(&lease);
            return;
        };
        let mode = lease.path();

        let coordinator = Arc::clone(&self.coordinator);
        let attempt_job = Arc::clone(&job);
        let attempt = tokio::spawn(async move { coordinator.run(&attempt_job, mode, worker).await });

        let outcome = match attempt.await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(
                    "Worker crashed during {} pass of {}: {}",
                    mode,
                    job.id().short(),
                    e
                );
                job.release_path(mode);
                self.handle_failure(&job, &lease, ErrorClass::WorkerCrash, format!("worker crashed: {}", e))
                    .await;
                return;
            }
        };

        match outcome {
            PathOutcome::Completed | PathOutcome::Discarded => {
                self.queue.ack(&lease);
            }
            PathOutcome::Deferred { delay } => {
                self.queue.requeue(&lease, delay);
            }
            PathOutcome::Failed(err) => {
                let class = err.class();
                let message = match &err {
                    BackendError::Content { kind, message } => format!("{}: {}", kind, message),
                    other => other.to_string(),
                };
                self.handle_failure(&job, &lease, class, message).await;
            }
        }
    }

    /// Retry with backoff, or dead-letter on a permanent error or exhausted budget
    async fn handle_failure(&self, job: &TrackedJob, lease: &Lease, class: ErrorClass, message: String) {
        let mode = lease.path();
        let retry_count = job.record_failure(mode, class, message.clone());

        if !class.is_retryable() {
            self.dead_letters.admit(job, class, message).await;
            self.queue.ack(lease);
            return;
        }
        if self.retry.exhausted(retry_count) {
            self.dead_letters.admit(
                job,
                class,
                format!("retries exhausted after {} failures: {}", retry_count, message),
            )
            .await;
            self.queue.ack(lease);
            return;
        }

        self.coordinator.persist(job, false).await;
        let delay = self.retry.delay_for(retry_count);
        tracing::warn!(
            "Retrying {} pass of {} in {:?} (retry {}/{}): {}",
            mode,
            job.id().short(),
            delay,
            retry_count,
            self.retry.max_retries,
            message
        );
        if !self.queue.requeue(lease, delay) {
            tracing::debug!("Lease for {} already redelivered", job.id().short());
        }
    }
}
