//! Job store persisted as JSON files in the data directory.
//!
//! Leases are held in memory, so this backend is only safe for a single
//! relay process. Every mutation rewrites the affected file through a
//! temporary file and an atomic rename; a failed write leaves memory as
//! it was.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{Job, JobBackend, JobStats, StoreError};

const JOBS_FILE: &str = "jobs.json";
const PROCESSED_FILE: &str = "processed_events.json";

#[derive(Debug)]
struct Lease {
    holder: String,
    expires_at: i64,
}

#[derive(Debug, Default)]
struct FileState {
    jobs: BTreeMap<String, Job>,
    processed: BTreeMap<String, i64>,
    leases: HashMap<String, Lease>,
}

pub struct FileJobBackend {
    jobs_path: PathBuf,
    processed_path: PathBuf,
    state: Mutex<FileState>,
}

impl FileJobBackend {
    /// Open the store in `dir`, creating it if needed.
    pub async fn open(dir: &Path) -> Result<Self, StoreError> {
        tokio::fs::create_dir_all(dir).await?;
        let jobs_path = dir.join(JOBS_FILE);
        let processed_path = dir.join(PROCESSED_FILE);

        let jobs: Vec<Job> = load_json(&jobs_path).await?;
        let processed: BTreeMap<String, i64> = load_json(&processed_path).await?;

        info!(
            path = %dir.display(),
            jobs = jobs.len(),
            processed = processed.len(),
            "File job store opened"
        );

        Ok(Self {
            jobs_path,
            processed_path,
            state: Mutex::new(FileState {
                jobs: jobs.into_iter().map(|j| (j.id.clone(), j)).collect(),
                processed,
                leases: HashMap::new(),
            }),
        })
    }

    async fn persist_jobs(&self, state: &FileState) -> Result<(), StoreError> {
        let jobs: Vec<&Job> = state.jobs.values().collect();
        write_json_atomic(&self.jobs_path, &jobs).await
    }

    async fn persist_processed(&self, state: &FileState) -> Result<(), StoreError> {
        write_json_atomic(&self.processed_path, &state.processed).await
    }
}

/// Read a JSON file, treating a missing or empty file as the default value.
///
/// An unparseable file is moved aside so the relay can keep running.
async fn load_json<T: DeserializeOwned + Default>(path: &Path) -> Result<T, StoreError> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
        Err(e) => return Err(e.into()),
    };
    if raw.trim().is_empty() {
        return Ok(T::default());
    }
    match serde_json::from_str(&raw) {
        Ok(value) => Ok(value),
        Err(e) => {
            let aside = path.with_extension("json.corrupt");
            warn!(path = %path.display(), error = %e, moved_to = %aside.display(), "Unreadable store file moved aside");
            tokio::fs::rename(path, &aside).await?;
            Ok(T::default())
        }
    }
}

/// Write JSON through `<file>.tmp` and rename it into place.
pub(crate) async fn write_json_atomic<T: Serialize + ?Sized>(
    path: &Path,
    value: &T,
) -> Result<(), StoreError> {
    let body = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, body).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl JobBackend for FileJobBackend {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn add_job(&self, job: &Job) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.jobs.contains_key(&job.id) {
            return Ok(());
        }
        state.jobs.insert(job.id.clone(), job.clone());
        if let Err(e) = self.persist_jobs(&state).await {
            state.jobs.remove(&job.id);
            return Err(e);
        }
        Ok(())
    }

    async fn due_jobs(&self, now: i64, limit: usize) -> Result<Vec<Job>, StoreError> {
        let state = self.state.lock().await;
        let mut due: Vec<Job> = state
            .jobs
            .values()
            .filter(|job| job.is_due(now))
            .cloned()
            .collect();
        due.sort_by(|a, b| a.run_at.cmp(&b.run_at).then_with(|| a.id.cmp(&b.id)));
        due.truncate(limit);
        Ok(due)
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>, StoreError> {
        Ok(self.state.lock().await.jobs.get(job_id).cloned())
    }

    async fn acquire_lock(
        &self,
        job_id: &str,
        holder: &str,
        ttl_ms: u64,
        now: i64,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        if state
            .leases
            .get(job_id)
            .is_some_and(|lease| lease.expires_at > now)
        {
            return Ok(false);
        }
        let ttl = i64::try_from(ttl_ms).unwrap_or(i64::MAX);
        state.leases.insert(
            job_id.to_string(),
            Lease {
                holder: holder.to_string(),
                expires_at: now.saturating_add(ttl),
            },
        );
        Ok(true)
    }

    async fn release_lock(&self, job_id: &str, holder: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state
            .leases
            .get(job_id)
            .is_some_and(|lease| lease.holder == holder)
        {
            state.leases.remove(job_id);
        }
        Ok(())
    }

    async fn increment_attempts(&self, job_id: &str) -> Result<u32, StoreError> {
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| StoreError::NotFound(job_id.to_string()))?;
        let previous = job.attempts;
        job.attempts = previous.saturating_add(1);
        let attempts = job.attempts;
        if let Err(e) = self.persist_jobs(&state).await {
            if let Some(job) = state.jobs.get_mut(job_id) {
                job.attempts = previous;
            }
            return Err(e);
        }
        Ok(attempts)
    }

    async fn reschedule(&self, job_id: &str, run_at: i64) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| StoreError::NotFound(job_id.to_string()))?;
        let previous = std::mem::replace(&mut job.run_at, run_at);
        if let Err(e) = self.persist_jobs(&state).await {
            if let Some(job) = state.jobs.get_mut(job_id) {
                job.run_at = previous;
            }
            return Err(e);
        }
        Ok(())
    }

    async fn remove_job(&self, job_id: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.leases.remove(job_id);
        if state.jobs.remove(job_id).is_some() {
            self.persist_jobs(&state).await?;
        }
        Ok(())
    }

    async fn is_event_processed(&self, event_id: &str) -> Result<bool, StoreError> {
        Ok(self.state.lock().await.processed.contains_key(event_id))
    }

    async fn mark_event_processed(&self, event_id: &str, now: i64) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.processed.contains_key(event_id) {
            return Ok(());
        }
        state.processed.insert(event_id.to_string(), now);
        if let Err(e) = self.persist_processed(&state).await {
            state.processed.remove(event_id);
            return Err(e);
        }
        Ok(())
    }

    async fn purge_processed(&self, older_than: i64) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let before = state.processed.len();
        state.processed.retain(|_, at| *at >= older_than);
        let removed = before - state.processed.len();
        if removed > 0 {
            self.persist_processed(&state).await?;
        }
        Ok(removed as u64)
    }

    async fn stats(&self, now: i64) -> Result<JobStats, StoreError> {
        let state = self.state.lock().await;
        let total = state.jobs.len() as u64;
        let due = state.jobs.values().filter(|j| j.is_due(now)).count() as u64;
        let oldest = state.jobs.values().map(|j| j.run_at).min();
        Ok(JobStats::from_counts(total, due, oldest))
    }

    async fn processed_count(&self) -> Result<u64, StoreError> {
        Ok(self.state.lock().await.processed.len() as u64)
    }
}
