//! Job queue, lease and dedup queries backing the `SQLite` job store.

use super::db::RelayDatabase;
use super::models::JobRow;
use netgate_core::db::DatabaseError;

/// Parameters for inserting a job.
pub struct NewJobParams<'a> {
    pub id: &'a str,
    pub kind: &'a str,
    pub origin_event_id: Option<&'a str>,
    pub run_at: i64,
    pub payload: &'a str,
    pub attempts: i64,
    pub created_at: i64,
}

impl RelayDatabase {
    // =========================================================================
    // Job queries
    // =========================================================================

    /// Insert a job. Re-inserting an existing id is a no-op.
    pub async fn insert_job(&self, params: &NewJobParams<'_>) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO jobs (id, kind, origin_event_id, run_at, payload, attempts, created_at) VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(params.id)
        .bind(params.kind)
        .bind(params.origin_event_id)
        .bind(params.run_at)
        .bind(params.payload)
        .bind(params.attempts)
        .bind(params.created_at)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Jobs with `run_at <= now`, oldest first.
    pub async fn due_jobs(&self, now: i64, limit: i64) -> Result<Vec<JobRow>, DatabaseError> {
        let rows = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM jobs WHERE run_at <= ? ORDER BY run_at ASC, id ASC LIMIT ?",
        )
        .bind(now)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        Ok(rows)
    }

    pub async fn get_job_row(&self, id: &str) -> Result<Option<JobRow>, DatabaseError> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;

        Ok(row)
    }

    /// Atomically bump the attempt counter and return the new value.
    pub async fn increment_job_attempts(&self, id: &str) -> Result<i64, DatabaseError> {
        let row: Option<(i64,)> =
            sqlx::query_as("UPDATE jobs SET attempts = attempts + 1 WHERE id = ? RETURNING attempts")
                .bind(id)
                .fetch_optional(self.pool())
                .await?;

        row.map(|r| r.0)
            .ok_or_else(|| DatabaseError::NotFound(format!("job {id}")))
    }

    pub async fn reschedule_job(&self, id: &str, run_at: i64) -> Result<bool, DatabaseError> {
        let result = sqlx::query("UPDATE jobs SET run_at = ? WHERE id = ?")
            .bind(run_at)
            .bind(id)
            .execute(self.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete a job together with any lease on it.
    pub async fn delete_job(&self, id: &str) -> Result<bool, DatabaseError> {
        let mut tx = self.pool().begin().await?;
        let result = sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM job_locks WHERE job_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(result.rows_affected() > 0)
    }

    /// Returns `(total, due, oldest_run_at)`.
    pub async fn job_counts(&self, now: i64) -> Result<(i64, i64, Option<i64>), DatabaseError> {
        let row: (i64, Option<i64>, Option<i64>) = sqlx::query_as(
            "SELECT COUNT(*), SUM(CASE WHEN run_at <= ? THEN 1 ELSE 0 END), MIN(run_at) FROM jobs",
        )
        .bind(now)
        .fetch_one(self.pool())
        .await?;

        Ok((row.0, row.1.unwrap_or(0), row.2))
    }

    // =========================================================================
    // Lease queries
    // =========================================================================

    /// Take the lease on a job if it is free or expired.
    ///
    /// The upsert only overwrites an existing row whose lease has expired, so
    /// exactly one concurrent caller sees `rows_affected == 1`.
    pub async fn try_acquire_job_lock(
        &self,
        job_id: &str,
        holder_id: &str,
        now: i64,
        ttl_ms: i64,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "INSERT INTO job_locks (job_id, holder_id, expires_at) VALUES (?, ?, ?)
             ON CONFLICT(job_id) DO UPDATE SET holder_id = excluded.holder_id, expires_at = excluded.expires_at
             WHERE job_locks.expires_at <= ?",
        )
        .bind(job_id)
        .bind(holder_id)
        .bind(now.saturating_add(ttl_ms))
        .bind(now)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Release a lease, only if `holder_id` still owns it.
    pub async fn release_job_lock(
        &self,
        job_id: &str,
        holder_id: &str,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM job_locks WHERE job_id = ? AND holder_id = ?")
            .bind(job_id)
            .bind(holder_id)
            .execute(self.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Processed event queries
    // =========================================================================

    pub async fn is_event_processed(&self, event_id: &str) -> Result<bool, DatabaseError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM processed_events WHERE event_id = ?")
                .bind(event_id)
                .fetch_optional(self.pool())
                .await?;

        Ok(row.is_some())
    }

    /// Record an event as processed. The first timestamp wins.
    pub async fn mark_event_processed(&self, event_id: &str, now: i64) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO processed_events (event_id, processed_at) VALUES (?, ?) ON CONFLICT(event_id) DO NOTHING",
        )
        .bind(event_id)
        .bind(now)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    pub async fn purge_processed_events(&self, older_than: i64) -> Result<u64, DatabaseError> {
        let result = sqlx::query("DELETE FROM processed_events WHERE processed_at < ?")
            .bind(older_than)
            .execute(self.pool())
            .await?;

        Ok(result.rows_affected())
    }

    pub async fn count_processed_events(&self) -> Result<i64, DatabaseError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM processed_events")
            .fetch_one(self.pool())
            .await?;

        Ok(row.0)
    }
}
