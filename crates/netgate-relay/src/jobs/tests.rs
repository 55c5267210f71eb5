//! Contract tests run against every job store backend.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use netgate_core::{ManualClock, Metrics};
use serde_json::json;

use super::*;
use crate::storage::RelayDatabase;

fn store_with(backend: Arc<dyn JobBackend>, clock: Arc<ManualClock>) -> JobStore {
    let settings = StoreSettings {
        lock_ttl_ms: 30_000,
        batch_size: 50,
        op_timeout: Duration::from_secs(5),
        processed_ttl_ms: 60_000,
    };
    JobStore::new(backend, settings, clock, Arc::new(Metrics::new()))
}

fn trial_job(run_at: i64) -> Job {
    Job::new(
        JobKind::RevokeTrial,
        Some("e1"),
        run_at,
        json!({"routerId": "R1", "mac": "AA:BB:CC:DD:EE:FF"}),
        0,
    )
}

/// Behaviour every backend must share.
async fn exercise_contract(backend: Arc<dyn JobBackend>) {
    let clock = Arc::new(ManualClock::new(0));
    let store = store_with(Arc::clone(&backend), Arc::clone(&clock));
    let other = store_with(backend, Arc::clone(&clock));

    let later = trial_job(300_000);
    let soon = trial_job(1_000);
    store.add_job(&later).await.unwrap();
    store.add_job(&soon).await.unwrap();
    // Re-adding is harmless.
    store.add_job(&soon).await.unwrap();

    assert!(store.get_due_jobs(0).await.is_empty());
    let due = store.get_due_jobs(1_000).await;
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].id, soon.id);
    assert_eq!(store.get_due_jobs(300_000).await.len(), 2);

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.due, 0);
    assert_eq!(stats.oldest_run_at, Some(1_000));

    // Leases are exclusive between holders until they expire.
    assert!(store.acquire_lock(&soon.id).await);
    assert!(!other.acquire_lock(&soon.id).await);
    other.release_lock(&soon.id).await;
    assert!(!other.acquire_lock(&soon.id).await);
    store.release_lock(&soon.id).await;
    assert!(other.acquire_lock(&soon.id).await);
    other.release_lock(&soon.id).await;

    assert_eq!(store.increment_attempts(&soon.id).await.unwrap(), 1);
    assert_eq!(store.increment_attempts(&soon.id).await.unwrap(), 2);
    store.reschedule_job(&soon.id, 500_000).await.unwrap();
    let reloaded = store.get_job(&soon.id).await.unwrap();
    assert_eq!(reloaded.attempts, 2);
    assert_eq!(reloaded.run_at, 500_000);
    assert_eq!(store.get_due_jobs(300_000).await.len(), 1);

    store.mark_processed(&soon.id).await.unwrap();
    assert!(store.get_job(&soon.id).await.is_none());
    assert!(store.increment_attempts(&soon.id).await.is_err());
    // A removed job is not resurrected by a late reschedule.
    assert!(matches!(
        store.reschedule_job(&soon.id, 900_000).await,
        Err(StoreError::NotFound(_))
    ));
    assert!(store.get_job(&soon.id).await.is_none());
    store.mark_processed(&soon.id).await.unwrap();

    // Dedup set with retention.
    assert!(!store.is_event_processed("e1").await);
    store.mark_event_processed("e1").await.unwrap();
    store.mark_event_processed("e1").await.unwrap();
    assert!(store.is_event_processed("e1").await);
    assert_eq!(store.processed_count().await, Some(1));

    clock.set(30_000);
    store.mark_event_processed("e2").await.unwrap();
    clock.set(70_000);
    assert_eq!(store.purge_processed().await.unwrap(), 1);
    assert!(!store.is_event_processed("e1").await);
    assert!(store.is_event_processed("e2").await);

    store.mark_processed(&later.id).await.unwrap();
}

#[tokio::test]
async fn sqlite_backend_contract() {
    let db = RelayDatabase::open_in_memory().await.unwrap();
    exercise_contract(Arc::new(SqliteJobBackend::new(db))).await;
}

#[tokio::test]
async fn file_backend_contract() {
    let dir = tempfile::tempdir().unwrap();
    exercise_contract(Arc::new(FileJobBackend::open(dir.path()).await.unwrap())).await;
}

#[tokio::test]
async fn redis_backend_contract() {
    let Ok(url) = std::env::var("NETGATE_TEST_REDIS_URL") else {
        return;
    };
    let namespace = format!("netgate-test-{}", uuid::Uuid::new_v4().simple());
    let backend = RedisJobBackend::connect(&url, &namespace).await.unwrap();
    exercise_contract(Arc::new(backend)).await;
}

#[tokio::test]
async fn file_backend_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let job = trial_job(10);
    {
        let backend = FileJobBackend::open(dir.path()).await.unwrap();
        backend.add_job(&job).await.unwrap();
        backend.mark_event_processed("e1", 5).await.unwrap();
    }
    let backend = FileJobBackend::open(dir.path()).await.unwrap();
    assert_eq!(backend.get_job(&job.id).await.unwrap(), Some(job));
    assert!(backend.is_event_processed("e1").await.unwrap());
}

#[tokio::test]
async fn file_backend_moves_corrupt_file_aside() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("jobs.json"), "{not json").unwrap();
    let backend = FileJobBackend::open(dir.path()).await.unwrap();
    assert_eq!(backend.stats(0).await.unwrap().total, 0);
    assert!(dir.path().join("jobs.json.corrupt").exists());
}

#[tokio::test]
async fn file_backend_rolls_back_failed_writes() {
    let dir = tempfile::tempdir().unwrap();
    let backend = FileJobBackend::open(dir.path()).await.unwrap();
    let kept = trial_job(10);
    backend.add_job(&kept).await.unwrap();

    // A directory in place of the jobs file makes every rename fail.
    std::fs::remove_file(dir.path().join("jobs.json")).unwrap();
    std::fs::create_dir(dir.path().join("jobs.json")).unwrap();

    let lost = trial_job(20);
    assert!(backend.add_job(&lost).await.is_err());
    assert_eq!(backend.get_job(&lost.id).await.unwrap(), None);

    assert!(backend.reschedule(&kept.id, 99).await.is_err());
    assert!(backend.increment_attempts(&kept.id).await.is_err());
    let current = backend.get_job(&kept.id).await.unwrap().unwrap();
    assert_eq!(current.run_at, 10);
    assert_eq!(current.attempts, 0);
    assert_eq!(backend.stats(0).await.unwrap().total, 1);
}

// === Degraded store ===

struct DownBackend {
    hang: bool,
}

impl DownBackend {
    async fn fail<T>(&self) -> Result<T, StoreError> {
        if self.hang {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        Err(StoreError::Io(std::io::Error::other("connection refused")))
    }
}

#[async_trait]
impl JobBackend for DownBackend {
    fn name(&self) -> &'static str {
        "down"
    }
    async fn add_job(&self, _: &Job) -> Result<(), StoreError> {
        self.fail().await
    }
    async fn due_jobs(&self, _: i64, _: usize) -> Result<Vec<Job>, StoreError> {
        self.fail().await
    }
    async fn get_job(&self, _: &str) -> Result<Option<Job>, StoreError> {
        self.fail().await
    }
    async fn acquire_lock(&self, _: &str, _: &str, _: u64, _: i64) -> Result<bool, StoreError> {
        self.fail().await
    }
    async fn release_lock(&self, _: &str, _: &str) -> Result<(), StoreError> {
        self.fail().await
    }
    async fn increment_attempts(&self, _: &str) -> Result<u32, StoreError> {
        self.fail().await
    }
    async fn reschedule(&self, _: &str, _: i64) -> Result<(), StoreError> {
        self.fail().await
    }
    async fn remove_job(&self, _: &str) -> Result<(), StoreError> {
        self.fail().await
    }
    async fn is_event_processed(&self, _: &str) -> Result<bool, StoreError> {
        self.fail().await
    }
    async fn mark_event_processed(&self, _: &str, _: i64) -> Result<(), StoreError> {
        self.fail().await
    }
    async fn purge_processed(&self, _: i64) -> Result<u64, StoreError> {
        self.fail().await
    }
    async fn stats(&self, _: i64) -> Result<JobStats, StoreError> {
        self.fail().await
    }
    async fn processed_count(&self) -> Result<u64, StoreError> {
        self.fail().await
    }
}

#[tokio::test]
async fn read_path_degrades_to_empty() {
    let metrics = Arc::new(Metrics::new());
    let store = JobStore::new(
        Arc::new(DownBackend { hang: false }),
        StoreSettings::default(),
        Arc::new(ManualClock::new(0)),
        Arc::clone(&metrics),
    );
    assert!(store.get_due_jobs(0).await.is_empty());
    assert!(!store.acquire_lock("j").await);
    assert!(!store.is_event_processed("e").await);
    assert!(store.stats().await.is_none());
    store.release_lock("j").await;
    assert_eq!(metrics.get("store.unavailable"), 5);

    // Writes still report the failure to the caller.
    assert!(store.add_job(&trial_job(0)).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn hung_backend_times_out() {
    let store = JobStore::new(
        Arc::new(DownBackend { hang: true }),
        StoreSettings::default(),
        Arc::new(ManualClock::new(0)),
        Arc::new(Metrics::new()),
    );
    let err = store.add_job(&trial_job(0)).await.unwrap_err();
    assert!(matches!(err, StoreError::Timeout("add_job")));
    assert!(store.get_due_jobs(0).await.is_empty());
}
