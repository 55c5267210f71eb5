//! Durable, lockable job queue with event dedup.
//!
//! Three interchangeable backends implement [`JobBackend`]:
//! - [`FileJobBackend`]: JSON files, single instance only
//! - [`SqliteJobBackend`]: the relay's `SQLite` database
//! - [`RedisJobBackend`]: shared Redis, safe across instances
//!
//! Callers go through [`JobStore`], which bounds every call with a timeout
//! and turns read-path failures into empty results so polling loops simply
//! try again on their next tick.

mod file;
mod model;
mod redis_store;
mod sqlite;

#[cfg(test)]
mod tests;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use netgate_core::config::StoreConfig;
use netgate_core::db::DatabaseError;
use netgate_core::{Clock, Metrics};
use tracing::{debug, warn};

pub use self::file::FileJobBackend;
pub(crate) use self::file::write_json_atomic;
pub use self::model::{Job, JobKind, JobStats};
pub use self::redis_store::RedisJobBackend;
pub use self::sqlite::SqliteJobBackend;

/// Job store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Corrupt job record {id}: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Job store timed out during {0}")]
    Timeout(&'static str),
}

/// Storage contract shared by every job store backend.
///
/// Lock acquisition must be atomic across every process sharing the
/// backend. Timestamps are epoch milliseconds supplied by the caller.
#[async_trait]
pub trait JobBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn add_job(&self, job: &Job) -> Result<(), StoreError>;

    /// Up to `limit` jobs with `run_at <= now`, oldest first.
    async fn due_jobs(&self, now: i64, limit: usize) -> Result<Vec<Job>, StoreError>;

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>, StoreError>;

    /// Set-if-absent lease owned by `holder` until `now + ttl_ms`.
    async fn acquire_lock(
        &self,
        job_id: &str,
        holder: &str,
        ttl_ms: u64,
        now: i64,
    ) -> Result<bool, StoreError>;

    /// Drop the lease if `holder` still owns it.
    async fn release_lock(&self, job_id: &str, holder: &str) -> Result<(), StoreError>;

    async fn increment_attempts(&self, job_id: &str) -> Result<u32, StoreError>;

    async fn reschedule(&self, job_id: &str, run_at: i64) -> Result<(), StoreError>;

    /// Delete a job. Completion and abandonment both end here.
    async fn remove_job(&self, job_id: &str) -> Result<(), StoreError>;

    async fn is_event_processed(&self, event_id: &str) -> Result<bool, StoreError>;

    async fn mark_event_processed(&self, event_id: &str, now: i64) -> Result<(), StoreError>;

    /// Forget processed events recorded before `older_than`.
    async fn purge_processed(&self, older_than: i64) -> Result<u64, StoreError>;

    async fn stats(&self, now: i64) -> Result<JobStats, StoreError>;

    async fn processed_count(&self) -> Result<u64, StoreError>;
}

/// Tunables for [`JobStore`].
#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub lock_ttl_ms: u64,
    pub batch_size: usize,
    pub op_timeout: Duration,
    pub processed_ttl_ms: i64,
}

impl From<&StoreConfig> for StoreSettings {
    #[allow(clippy::cast_possible_wrap)]
    fn from(config: &StoreConfig) -> Self {
        Self {
            lock_ttl_ms: config.lock_ttl_ms,
            batch_size: config.batch_size.max(1),
            op_timeout: Duration::from_millis(config.op_timeout_ms),
            processed_ttl_ms: (config.processed_ttl_secs as i64).saturating_mul(1000),
        }
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self::from(&StoreConfig::default())
    }
}

/// Backend-agnostic job store used by the state machine and the runner.
#[derive(Clone)]
pub struct JobStore {
    backend: Arc<dyn JobBackend>,
    holder_id: String,
    settings: StoreSettings,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
}

impl JobStore {
    pub fn new(
        backend: Arc<dyn JobBackend>,
        settings: StoreSettings,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            backend,
            holder_id: format!("relay-{}", uuid::Uuid::new_v4().simple()),
            settings,
            clock,
            metrics,
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Identity this instance uses when holding job leases.
    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    async fn timed<T, F>(&self, op: &'static str, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        tokio::time::timeout(self.settings.op_timeout, fut)
            .await
            .unwrap_or(Err(StoreError::Timeout(op)))
    }

    fn degrade<T>(&self, op: &'static str, result: Result<T, StoreError>, fallback: T) -> T {
        match result {
            Ok(value) => value,
            Err(e) => {
                warn!(backend = self.backend.name(), op, error = %e, "Job store unavailable");
                self.metrics.inc("store.unavailable");
                fallback
            }
        }
    }

    // =========================================================================
    // Write path (errors propagate)
    // =========================================================================

    pub async fn add_job(&self, job: &Job) -> Result<(), StoreError> {
        self.timed("add_job", self.backend.add_job(job)).await?;
        debug!(job_id = %job.id, kind = %job.kind, run_at = job.run_at, "Job added");
        Ok(())
    }

    pub async fn increment_attempts(&self, job_id: &str) -> Result<u32, StoreError> {
        self.timed("increment_attempts", self.backend.increment_attempts(job_id))
            .await
    }

    pub async fn reschedule_job(&self, job_id: &str, run_at: i64) -> Result<(), StoreError> {
        self.timed("reschedule", self.backend.reschedule(job_id, run_at))
            .await
    }

    /// Complete a job: it is deleted, not archived.
    pub async fn mark_processed(&self, job_id: &str) -> Result<(), StoreError> {
        self.timed("remove_job", self.backend.remove_job(job_id)).await
    }

    pub async fn mark_event_processed(&self, event_id: &str) -> Result<(), StoreError> {
        let now = self.clock.now_ms();
        self.timed(
            "mark_event_processed",
            self.backend.mark_event_processed(event_id, now),
        )
        .await
    }

    /// Drop dedup records older than the retention window.
    pub async fn purge_processed(&self) -> Result<u64, StoreError> {
        if self.settings.processed_ttl_ms <= 0 {
            return Ok(0);
        }
        let cutoff = self
            .clock
            .now_ms()
            .saturating_sub(self.settings.processed_ttl_ms);
        self.timed("purge_processed", self.backend.purge_processed(cutoff))
            .await
    }

    // =========================================================================
    // Read path (errors degrade)
    // =========================================================================

    pub async fn get_due_jobs(&self, now: i64) -> Vec<Job> {
        let result = self
            .timed(
                "due_jobs",
                self.backend.due_jobs(now, self.settings.batch_size),
            )
            .await;
        self.degrade("due_jobs", result, Vec::new())
    }

    pub async fn get_job(&self, job_id: &str) -> Option<Job> {
        let result = self.timed("get_job", self.backend.get_job(job_id)).await;
        self.degrade("get_job", result, None)
    }

    /// Try to lease a job for this instance. `false` means another holder
    /// owns it or the store is unreachable.
    pub async fn acquire_lock(&self, job_id: &str) -> bool {
        let now = self.clock.now_ms();
        let result = self
            .timed(
                "acquire_lock",
                self.backend
                    .acquire_lock(job_id, &self.holder_id, self.settings.lock_ttl_ms, now),
            )
            .await;
        self.degrade("acquire_lock", result, false)
    }

    pub async fn release_lock(&self, job_id: &str) {
        let result = self
            .timed(
                "release_lock",
                self.backend.release_lock(job_id, &self.holder_id),
            )
            .await;
        self.degrade("release_lock", result, ());
    }

    pub async fn is_event_processed(&self, event_id: &str) -> bool {
        let result = self
            .timed("is_event_processed", self.backend.is_event_processed(event_id))
            .await;
        self.degrade("is_event_processed", result, false)
    }

    pub async fn stats(&self) -> Option<JobStats> {
        let now = self.clock.now_ms();
        let result = self.timed("stats", self.backend.stats(now)).await;
        self.degrade("stats", result.map(Some), None)
    }

    pub async fn processed_count(&self) -> Option<u64> {
        let result = self
            .timed("processed_count", self.backend.processed_count())
            .await;
        self.degrade("processed_count", result.map(Some), None)
    }
}
