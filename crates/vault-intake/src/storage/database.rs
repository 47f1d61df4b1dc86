//! SQLite persistence for jobs and dead letters
//!
//! Every state transition is upserted so that jobs left in a non-terminal state
//! by a crash can be redelivered on the next start.

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::processing::{DeadLetterEntry, RetryRecord};
use crate::types::{Job, JobId, JobState, ProcessingResult};

/// A job row as persisted
#[derive(Debug, Clone)]
pub struct StoredJob {
    pub job: Job,
    pub state: JobState,
    pub result: Option<ProcessingResult>,
    pub result_version: u64,
    pub retry_history: Vec<RetryRecord>,
}

/// SQLite-backed job store
pub struct JobStore {
    conn: Arc<Mutex<Connection>>,
}

impl JobStore {
    /// Create or open the database at the given path
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| Error::Database(format!("Failed to open database: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.migrate()?;
        Ok(db)
    }

    /// Create an in-memory database (for testing)
    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Database(format!("Failed to open in-memory database: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.migrate()?;
        Ok(db)
    }

    /// Run database migrations
    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA temp_store=MEMORY;
        "#).map_err(|e| Error::Database(format!("Failed to set pragmas: {}", e)))?;

        conn.execute_batch(r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                source_path TEXT NOT NULL,
                state TEXT NOT NULL,
                tier TEXT NOT NULL,
                category TEXT NOT NULL,
                score INTEGER NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                enqueued_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                job_json TEXT NOT NULL,
                result_json TEXT,
                result_version INTEGER NOT NULL DEFAULT 0,
                retry_history TEXT NOT NULL DEFAULT '[]'
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state);
            CREATE INDEX IF NOT EXISTS idx_jobs_enqueued_at ON jobs(enqueued_at);

            CREATE TABLE IF NOT EXISTS dead_letters (
                job_id TEXT PRIMARY KEY,
                error_class TEXT NOT NULL,
                message TEXT NOT NULL,
                entry_json TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
        "#).map_err(|e| Error::Database(format!("Failed to create tables: {}", e)))?;

        // databases created before retry history was stored
        let has_history: bool = conn
            .query_row(
                "SELECT COUNT(*) FROM pragma_table_info('jobs') WHERE name = 'retry_history'",
                [],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n > 0)
            .map_err(|e| Error::Database(format!("Failed to inspect jobs table: {}", e)))?;
        if !has_history {
            conn.execute_batch("ALTER TABLE jobs ADD COLUMN retry_history TEXT NOT NULL DEFAULT '[]'")
                .map_err(|e| Error::Database(format!("Failed to add retry history: {}", e)))?;
        }

        Ok(())
    }

    /// Insert or update a job. A `None` result keeps the stored one;
    /// the retry history always replaces it.
    pub fn upsert_job(
        &self,
        job: &Job,
        state: JobState,
        result: Option<(&ProcessingResult, u64)>,
        history: &[RetryRecord],
    ) -> Result<()> {
        let job_json = serde_json::to_string(job)?;
        let history_json = serde_json::to_string(history)?;
        let result_json = result.map(|(r, _)| serde_json::to_string(r)).transpose()?;
        let result_version = result.map(|(_, v)| v as i64);

        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO jobs (id, source_path, state, tier, category, score, retry_count,
                              enqueued_at, updated_at, job_json, result_json, result_version,
                              retry_history)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, COALESCE(?12, 0), ?13)
            ON CONFLICT(id) DO UPDATE SET
                source_path = excluded.source_path,
                state = excluded.state,
                retry_count = excluded.retry_count,
                updated_at = excluded.updated_at,
                job_json = excluded.job_json,
                result_json = COALESCE(?11, jobs.result_json),
                result_version = COALESCE(?12, jobs.result_version),
                retry_history = excluded.retry_history
            "#,
            params![
                job.id.as_str(),
                job.source_path.to_string_lossy(),
                state.as_str(),
                job.tier.as_str(),
                job.category().as_str(),
                job.score as i64,
                job.retry_count as i64,
                job.enqueued_at.to_rfc3339(),
                Utc::now().to_rfc3339(),
                job_json,
                result_json,
                result_version,
                history_json,
            ],
        ).map_err(|e| Error::Database(format!("Failed to upsert job: {}", e)))?;

        Ok(())
    }

    /// Get a job by id
    pub fn get_job(&self, id: &JobId) -> Result<Option<StoredJob>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT job_json, state, result_json, result_version, retry_history FROM jobs WHERE id = ?1",
            params![id.as_str()],
            row_to_stored_job,
        )
        .optional()
        .map_err(|e| Error::Database(format!("Failed to get job: {}", e)))
    }

    /// Jobs that had not reached a terminal state, oldest first
    pub fn incomplete_jobs(&self) -> Result<Vec<StoredJob>> {
        let conn = self.conn.lock();

        let mut stmt = conn.prepare(
            "SELECT job_json, state, result_json, result_version, retry_history FROM jobs
             WHERE state NOT IN ('archived', 'dead-lettered', 'cancelled')
             ORDER BY enqueued_at ASC"
        ).map_err(|e| Error::Database(format!("Failed to prepare query: {}", e)))?;

        let jobs = stmt.query_map([], row_to_stored_job)
            .map_err(|e| Error::Database(format!("Failed to list incomplete jobs: {}", e)))?
            .filter_map(|r| match r {
                Ok(job) => Some(job),
                Err(e) => {
                    tracing::warn!("Skipping unreadable job row: {}", e);
                    None
                }
            })
            .collect();

        Ok(jobs)
    }

    /// Delete a job
    pub fn delete_job(&self, id: &JobId) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute("DELETE FROM jobs WHERE id = ?1", params![id.as_str()])
            .map_err(|e| Error::Database(format!("Failed to delete job: {}", e)))?;
        Ok(rows > 0)
    }

    /// Record a dead letter
    pub fn insert_dead_letter(&self, entry: &DeadLetterEntry) -> Result<()> {
        let entry_json = serde_json::to_string(entry)?;
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT OR REPLACE INTO dead_letters (job_id, error_class, message, entry_json, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                entry.job.id.as_str(),
                entry.error_class.to_string(),
                entry.message,
                entry_json,
                entry.dead_lettered_at.to_rfc3339(),
            ],
        ).map_err(|e| Error::Database(format!("Failed to insert dead letter: {}", e)))?;
        Ok(())
    }

    /// Remove a dead letter
    pub fn remove_dead_letter(&self, id: &JobId) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute("DELETE FROM dead_letters WHERE job_id = ?1", params![id.as_str()])
            .map_err(|e| Error::Database(format!("Failed to remove dead letter: {}", e)))?;
        Ok(rows > 0)
    }

    /// All dead letters, oldest first
    pub fn dead_letters(&self) -> Result<Vec<DeadLetterEntry>> {
        let conn = self.conn.lock();

        let mut stmt = conn.prepare(
            "SELECT entry_json FROM dead_letters ORDER BY created_at ASC"
        ).map_err(|e| Error::Database(format!("Failed to prepare query: {}", e)))?;

        let entries = stmt.query_map([], |row| {
            let json: String = row.get(0)?;
            serde_json::from_str::<DeadLetterEntry>(&json).map_err(|e| json_column_error(0, e))
        })
        .map_err(|e| Error::Database(format!("Failed to list dead letters: {}", e)))?
        .filter_map(|r| r.ok())
        .collect();

        Ok(entries)
    }
}

fn json_column_error(column: usize, err: serde_json::Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(err))
}

fn row_to_stored_job(row: &rusqlite::Row) -> rusqlite::Result<StoredJob> {
    let job_json: String = row.get(0)?;
    let state_str: String = row.get(1)?;
    let result_json: Option<String> = row.get(2)?;
    let result_version: i64 = row.get(3)?;
    let history_json: String = row.get(4)?;

    let job: Job = serde_json::from_str(&job_json).map_err(|e| json_column_error(0, e))?;
    let result = result_json
        .map(|json| serde_json::from_str::<ProcessingResult>(&json))
        .transpose()
        .map_err(|e| json_column_error(2, e))?;
    let retry_history =
        serde_json::from_str(&history_json).map_err(|e| json_column_error(4, e))?;

    Ok(StoredJob {
        job,
        state: JobState::parse(&state_str).unwrap_or(JobState::Queued),
        result,
        result_version: result_version.max(0) as u64,
        retry_history,
    })
}
