//! Dead-letter store: terminal holding area for jobs that will not be retried
//!
//! Entries are held for manual review. Nothing in the pipeline ever reads them
//! back into a queue on its own; resubmission is an explicit external call.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::job_table::TrackedJob;
use super::retry::{ErrorClass, RetryRecord};
use crate::error::Result;
use crate::storage::JobStore;
use crate::types::{Job, JobId, JobState};

/// A dead-lettered job with its terminal error and full retry history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub job: Job,
    pub error_class: ErrorClass,
    pub message: String,
    pub retry_count: u32,
    pub retry_history: Vec<RetryRecord>,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Dead-letter store, mirrored to SQLite when storage is enabled
pub struct DeadLetterStore {
    entries: DashMap<JobId, DeadLetterEntry>,
    database: Option<Arc<JobStore>>,
}

impl DeadLetterStore {
    pub fn new(database: Option<Arc<JobStore>>) -> Self {
        Self {
            entries: DashMap::new(),
            database,
        }
    }

    /// Reload persisted entries after a restart
    pub fn load(&self) -> Result<usize> {
        let Some(db) = &self.database else {
            return Ok(0);
        };
        let entries = db.dead_letters()?;
        let count = entries.len();
        for entry in entries {
            self.entries.insert(entry.job.id.clone(), entry);
        }
        Ok(count)
    }

    /// Move a job into the dead-letter state and record it.
    /// Returns `None` if the job already reached another terminal state.
    pub async fn admit(
        &self,
        job: &TrackedJob,
        error_class: ErrorClass,
        message: impl Into<String>,
    ) -> Option<DeadLetterEntry> {
        let previous = job
            .state_cell()
            .update(|s| (!s.is_terminal()).then_some(JobState::DeadLettered))
            .ok()?;

        let snapshot = job.snapshot();
        let entry = DeadLetterEntry {
            retry_count: snapshot.retry_count,
            job: snapshot,
            error_class,
            message: message.into(),
            retry_history: job.history(),
            dead_lettered_at: Utc::now(),
        };

        tracing::error!(
            "Job {} dead-lettered from {} ({}): {} [retries: {}]",
            entry.job.id.short(),
            previous,
            error_class,
            entry.message,
            entry.retry_count
        );

        self.entries.insert(entry.job.id.clone(), entry.clone());
        if let Some(db) = &self.database {
            let db = Arc::clone(db);
            let row = entry.clone();
            let written = tokio::task::spawn_blocking(move || {
                db.insert_dead_letter(&row)?;
                db.upsert_job(&row.job, JobState::DeadLettered, None, &row.retry_history)
            })
            .await;
            match written {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!("Failed to persist dead letter {}: {}", entry.job.id.short(), e)
                }
                Err(e) => {
                    tracing::error!("Persist task for dead letter {} failed: {}", entry.job.id.short(), e)
                }
            }
        }
        Some(entry)
    }

    pub fn get(&self, id: &JobId) -> Option<DeadLetterEntry> {
        self.entries.get(id).map(|e| e.value().clone())
    }

    /// All entries, oldest first
    pub fn list(&self) -> Vec<DeadLetterEntry> {
        let mut all: Vec<_> = self.entries.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|e| e.dead_lettered_at);
        all
    }

    /// Remove an entry ahead of an explicit resubmission
    pub fn take(&self, id: &JobId) -> Option<DeadLetterEntry> {
        let (_, entry) = self.entries.remove(id)?;
        if let Some(db) = &self.database {
            if let Err(e) = db.remove_dead_letter(id) {
                tracing::error!("Failed to remove dead letter {}: {}", id.short(), e);
            }
        }
        Some(entry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::job_table::test_support::job;
    use crate::types::{PathMode, ProcessingCategory, QueueTier, RequiredPaths};

    fn tracked(tag: &str) -> TrackedJob {
        TrackedJob::new(job(tag, ProcessingCategory::Documents, QueueTier::Normal, RequiredPaths::Both))
    }

    #[tokio::test]
    async fn test_content_error_dead_letters_with_zero_retries() {
        let store = DeadLetterStore::new(None);
        let job = tracked("corrupt");
        job.record_failure(PathMode::Fast, ErrorClass::Content, "corrupt xref table");

        let entry = store.admit(&job, ErrorClass::Content, "corrupt xref table").await.unwrap();
        assert_eq!(entry.retry_count, 0);
        assert_eq!(entry.retry_history.len(), 1);
        assert_eq!(job.state(), JobState::DeadLettered);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_terminal_jobs_are_not_admitted_twice() {
        let store = DeadLetterStore::new(None);
        let job = tracked("twice");
        assert!(store.admit(&job, ErrorClass::Transient, "first").await.is_some());
        assert!(store.admit(&job, ErrorClass::Transient, "second").await.is_none());
        assert_eq!(store.get(&job.id()).unwrap().message, "first");
    }

    #[tokio::test]
    async fn test_take_removes_entry() {
        let store = DeadLetterStore::new(None);
        let job = tracked("take");
        store.admit(&job, ErrorClass::Quarantined, "empty file").await;
        assert!(store.take(&job.id()).is_some());
        assert!(store.is_empty());
        assert!(store.take(&job.id()).is_none());
    }

    #[tokio::test]
    async fn test_persisted_entries_reload() {
        let db = Arc::new(JobStore::in_memory().unwrap());
        let store = DeadLetterStore::new(Some(Arc::clone(&db)));
        let job = tracked("persisted");
        job.record_failure(PathMode::Deep, ErrorClass::Transient, "503");
        store.admit(&job, ErrorClass::Transient, "retries exhausted").await;

        let reloaded = DeadLetterStore::new(Some(db.clone()));
        assert_eq!(reloaded.load().unwrap(), 1);
        let entry = reloaded.get(&job.id()).unwrap();
        assert_eq!(entry.retry_history.len(), 1);
        assert_eq!(entry.error_class, ErrorClass::Transient);

        let row = db.get_job(&job.id()).unwrap().unwrap();
        assert_eq!(row.state, JobState::DeadLettered);
        assert_eq!(row.retry_history.len(), 1);
    }
}
