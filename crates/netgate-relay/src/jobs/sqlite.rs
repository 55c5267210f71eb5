//! Job store backed by the relay's `SQLite` database.

use async_trait::async_trait;
use netgate_core::db::DatabaseError;
use tracing::warn;

use super::{Job, JobBackend, JobStats, StoreError};
use crate::storage::{JobRow, NewJobParams, RelayDatabase};

/// Lease and dedup state live in the same file as the queue, so several
/// relay processes on one host can share it.
#[derive(Clone)]
pub struct SqliteJobBackend {
    db: RelayDatabase,
}

impl SqliteJobBackend {
    pub const fn new(db: RelayDatabase) -> Self {
        Self { db }
    }
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let kind = row.kind.parse().map_err(|reason| StoreError::Corrupt {
            id: row.id.clone(),
            reason,
        })?;
        let payload = serde_json::from_str(&row.payload).map_err(|e| StoreError::Corrupt {
            id: row.id.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            id: row.id,
            kind,
            origin_event_id: row.origin_event_id,
            run_at: row.run_at,
            payload,
            attempts: u32::try_from(row.attempts).unwrap_or(0),
            created_at: row.created_at,
        })
    }
}

#[async_trait]
impl JobBackend for SqliteJobBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn add_job(&self, job: &Job) -> Result<(), StoreError> {
        let payload = serde_json::to_string(&job.payload)?;
        self.db
            .insert_job(&NewJobParams {
                id: &job.id,
                kind: job.kind.as_str(),
                origin_event_id: job.origin_event_id.as_deref(),
                run_at: job.run_at,
                payload: &payload,
                attempts: i64::from(job.attempts),
                created_at: job.created_at,
            })
            .await?;
        Ok(())
    }

    async fn due_jobs(&self, now: i64, limit: usize) -> Result<Vec<Job>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = self.db.due_jobs(now, limit).await?;
        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            match Job::try_from(row) {
                Ok(job) => jobs.push(job),
                Err(e) => warn!(error = %e, "Skipping unreadable job row"),
            }
        }
        Ok(jobs)
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>, StoreError> {
        self.db
            .get_job_row(job_id)
            .await?
            .map(Job::try_from)
            .transpose()
    }

    async fn acquire_lock(
        &self,
        job_id: &str,
        holder: &str,
        ttl_ms: u64,
        now: i64,
    ) -> Result<bool, StoreError> {
        let ttl = i64::try_from(ttl_ms).unwrap_or(i64::MAX);
        match self.db.try_acquire_job_lock(job_id, holder, now, ttl).await {
            // Another instance is writing the same file; treat as contention.
            Err(DatabaseError::Busy(_)) => Ok(false),
            other => Ok(other?),
        }
    }

    async fn release_lock(&self, job_id: &str, holder: &str) -> Result<(), StoreError> {
        self.db.release_job_lock(job_id, holder).await?;
        Ok(())
    }

    async fn increment_attempts(&self, job_id: &str) -> Result<u32, StoreError> {
        match self.db.increment_job_attempts(job_id).await {
            Ok(attempts) => Ok(u32::try_from(attempts).unwrap_or(u32::MAX)),
            Err(DatabaseError::NotFound(_)) => Err(StoreError::NotFound(job_id.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn reschedule(&self, job_id: &str, run_at: i64) -> Result<(), StoreError> {
        if self.db.reschedule_job(job_id, run_at).await? {
            Ok(())
        } else {
            Err(StoreError::NotFound(job_id.to_string()))
        }
    }

    async fn remove_job(&self, job_id: &str) -> Result<(), StoreError> {
        self.db.delete_job(job_id).await?;
        Ok(())
    }

    async fn is_event_processed(&self, event_id: &str) -> Result<bool, StoreError> {
        Ok(self.db.is_event_processed(event_id).await?)
    }

    async fn mark_event_processed(&self, event_id: &str, now: i64) -> Result<(), StoreError> {
        self.db.mark_event_processed(event_id, now).await?;
        Ok(())
    }

    async fn purge_processed(&self, older_than: i64) -> Result<u64, StoreError> {
        Ok(self.db.purge_processed_events(older_than).await?)
    }

    async fn stats(&self, now: i64) -> Result<JobStats, StoreError> {
        let (total, due, oldest) = self.db.job_counts(now).await?;
        Ok(JobStats::from_counts(
            u64::try_from(total).unwrap_or(0),
            u64::try_from(due).unwrap_or(0),
            oldest,
        ))
    }

    async fn processed_count(&self) -> Result<u64, StoreError> {
        let count = self.db.count_processed_events().await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}
