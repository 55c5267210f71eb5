//! Job runner: executes due jobs under a lease with exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use netgate_core::config::JobConfig;
use netgate_core::{Clock, Metrics};
use rand::Rng;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::actions::{ActionHandler, ActionKind, ActionRequest, router_field};
use crate::jobs::{Job, JobKind, JobStore};
use crate::machine::{Event, Reason, StateMachine};

/// Retry schedule for failed jobs.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base_ms: u64,
    pub jitter_cap_ms: u64,
    pub max_attempts: u32,
}

impl From<&JobConfig> for BackoffPolicy {
    fn from(config: &JobConfig) -> Self {
        Self {
            base_ms: config.backoff_base_ms.max(1),
            jitter_cap_ms: config.jitter_cap_ms,
            max_attempts: config.max_attempts.max(1),
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from(&JobConfig::default())
    }
}

impl BackoffPolicy {
    /// `base * 2^(attempts-1)`, saturating.
    pub fn base_delay_ms(&self, attempts: u32) -> u64 {
        let exp = attempts.saturating_sub(1).min(63);
        self.base_ms.saturating_mul(1u64 << exp)
    }

    /// Exclusive upper bound of the jitter added after `attempts` failures.
    ///
    /// Bounded by the base delay itself so the delay ranges of consecutive
    /// attempts never overlap.
    pub fn jitter_bound_ms(&self, attempts: u32) -> u64 {
        self.jitter_cap_ms.min(self.base_delay_ms(attempts))
    }

    /// Delay before the next try, after `attempts` failures.
    pub fn delay_ms(&self, attempts: u32, rng: &mut impl Rng) -> u64 {
        let bound = self.jitter_bound_ms(attempts);
        let jitter = if bound == 0 { 0 } else { rng.gen_range(0..bound) };
        self.base_delay_ms(attempts).saturating_add(jitter)
    }

    pub const fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

/// Counts from one runner tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub due: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub gave_up: usize,
    pub skipped: usize,
}

/// Where a retryable failure left the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Retry {
    Rescheduled,
    Abandoned,
    /// The attempt could not be recorded; the job is untouched and due again.
    Unrecorded,
}

/// Why a job did not complete.
#[derive(Debug, thiserror::Error)]
enum JobError {
    /// Try again later.
    #[error("{0}")]
    Retryable(String),
    /// Can never succeed; drop the job.
    #[error("{0}")]
    Fatal(String),
}

pub struct JobRunner {
    store: JobStore,
    machine: Arc<StateMachine>,
    actions: Arc<ActionHandler>,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
    policy: BackoffPolicy,
}

impl JobRunner {
    pub fn new(
        store: JobStore,
        machine: Arc<StateMachine>,
        actions: Arc<ActionHandler>,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
        policy: BackoffPolicy,
    ) -> Self {
        Self {
            store,
            machine,
            actions,
            clock,
            metrics,
            policy,
        }
    }

    /// Run every job due now, once.
    pub async fn run_due_jobs(&self) -> TickSummary {
        let now = self.clock.now_ms();
        let jobs = self.store.get_due_jobs(now).await;
        let mut summary = TickSummary {
            due: jobs.len(),
            ..TickSummary::default()
        };

        for job in jobs {
            if !self.store.acquire_lock(&job.id).await {
                self.metrics.inc("job.lock_contention");
                debug!(job_id = %job.id, "Job leased elsewhere, skipping");
                summary.skipped += 1;
                continue;
            }

            // Another holder may have finished or rescheduled it since listing.
            match self.store.get_job(&job.id).await {
                Some(current) if current.is_due(now) => {
                    self.run_leased(&current, &mut summary).await;
                }
                _ => summary.skipped += 1,
            }
            self.store.release_lock(&job.id).await;
        }

        if summary.due > 0 {
            info!(
                due = summary.due,
                succeeded = summary.succeeded,
                failed = summary.failed,
                gave_up = summary.gave_up,
                skipped = summary.skipped,
                "Job runner tick"
            );
        }
        summary
    }

    async fn run_leased(&self, job: &Job, summary: &mut TickSummary) {
        match self.run_job(job).await {
            Ok(()) => {
                if let Err(e) = self.store.mark_processed(&job.id).await {
                    warn!(job_id = %job.id, error = %e, "Could not remove completed job");
                }
                self.metrics.inc(&format!("job.{}.success", job.kind));
                info!(job_id = %job.id, kind = %job.kind, "Job completed");
                summary.succeeded += 1;
            }
            Err(JobError::Fatal(msg)) => {
                self.give_up(job, &msg).await;
                summary.gave_up += 1;
            }
            Err(JobError::Retryable(msg)) => match self.retry_later(job, &msg).await {
                Retry::Rescheduled | Retry::Unrecorded => summary.failed += 1,
                Retry::Abandoned => summary.gave_up += 1,
            },
        }
    }

    async fn run_job(&self, job: &Job) -> Result<(), JobError> {
        match job.kind {
            JobKind::RevokeTrial => self.revoke_trial(job).await,
            JobKind::RetryEvent => self.retry_event(job).await,
        }
    }

    async fn revoke_trial(&self, job: &Job) -> Result<(), JobError> {
        let router_id = router_field(&job.payload)
            .ok_or_else(|| JobError::Fatal("job payload has no routerId".to_string()))?;
        if !self.actions.circuit().allow_request(&router_id) {
            return Err(JobError::Retryable(format!(
                "circuit open for router {router_id}"
            )));
        }
        let payload = json!({
            "routerId": router_id,
            "ip": job.payload.get("ip"),
            "mac": job.payload.get("mac"),
        });
        let response = self
            .actions
            .execute(ActionRequest::new(
                ActionKind::RevokeSession,
                payload,
                "job:REVOKE_TRIAL",
                &job.id,
            ))
            .await;
        if response.ok {
            return Ok(());
        }
        let message = response
            .error
            .map_or_else(|| "revoke failed".to_string(), |e| e.message);
        Err(JobError::Retryable(message))
    }

    async fn retry_event(&self, job: &Job) -> Result<(), JobError> {
        let event: Event = serde_json::from_value(job.payload.clone())
            .map_err(|e| JobError::Fatal(format!("undecodable event: {e}")))?;
        let outcome = self.machine.replay_event(&event).await;
        if outcome.ok {
            return Ok(());
        }
        let message = outcome.error.unwrap_or_default();
        match outcome.reason {
            Some(Reason::Validation | Reason::UnknownType) => Err(JobError::Fatal(message)),
            _ => Err(JobError::Retryable(message)),
        }
    }

    /// Count the failure and either reschedule or abandon the job.
    async fn retry_later(&self, job: &Job, error: &str) -> Retry {
        let attempts = match self.store.increment_attempts(&job.id).await {
            Ok(attempts) => attempts,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Could not record job attempt, job left due");
                return Retry::Unrecorded;
            }
        };
        if self.policy.exhausted(attempts) {
            self.give_up(job, error).await;
            return Retry::Abandoned;
        }

        let delay = self.policy.delay_ms(attempts, &mut rand::thread_rng());
        let run_at = self
            .clock
            .now_ms()
            .saturating_add(i64::try_from(delay).unwrap_or(i64::MAX));
        if let Err(e) = self.store.reschedule_job(&job.id, run_at).await {
            warn!(job_id = %job.id, error = %e, "Could not reschedule job, job left due");
            return Retry::Unrecorded;
        }
        self.metrics.inc(&format!("job.{}.failed", job.kind));
        warn!(job_id = %job.id, kind = %job.kind, attempts, delay_ms = delay, error, "Job failed, rescheduled");
        Retry::Rescheduled
    }

    async fn give_up(&self, job: &Job, error: &str) {
        if let Err(e) = self.store.mark_processed(&job.id).await {
            warn!(job_id = %job.id, error = %e, "Could not remove abandoned job");
        }
        self.metrics.inc(&format!("job.{}.giveup", job.kind));
        warn!(job_id = %job.id, kind = %job.kind, attempts = job.attempts, error, "Job abandoned");
    }
}

/// Spawn the runner loop, ticking every `tick` until `shutdown` fires.
pub fn spawn_job_runner_task(
    runner: Arc<JobRunner>,
    tick: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(tick);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = timer.tick() => {
                    runner.run_due_jobs().await;
                }
                _ = shutdown.changed() => {
                    info!("Job runner shutting down");
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use async_trait::async_trait;
    use netgate_core::ManualClock;
    use netgate_core::config::RouterConfig;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;
    use crate::circuit::{CircuitBreaker, CircuitBreakerConfig};
    use crate::driver::DryRunDriver;
    use crate::jobs::{JobBackend, JobStats, SqliteJobBackend, StoreError, StoreSettings};
    use crate::machine::MachineSettings;
    use crate::storage::RelayDatabase;

    const NOW: i64 = 1_700_000_000_000;

    /// `SQLite` backend whose attempt counter is unavailable.
    struct NoAttempts(SqliteJobBackend);

    #[async_trait]
    impl JobBackend for NoAttempts {
        fn name(&self) -> &'static str {
            "no-attempts"
        }
        async fn add_job(&self, job: &Job) -> Result<(), StoreError> {
            self.0.add_job(job).await
        }
        async fn due_jobs(&self, now: i64, limit: usize) -> Result<Vec<Job>, StoreError> {
            self.0.due_jobs(now, limit).await
        }
        async fn get_job(&self, job_id: &str) -> Result<Option<Job>, StoreError> {
            self.0.get_job(job_id).await
        }
        async fn acquire_lock(
            &self,
            job_id: &str,
            holder: &str,
            ttl_ms: u64,
            now: i64,
        ) -> Result<bool, StoreError> {
            self.0.acquire_lock(job_id, holder, ttl_ms, now).await
        }
        async fn release_lock(&self, job_id: &str, holder: &str) -> Result<(), StoreError> {
            self.0.release_lock(job_id, holder).await
        }
        async fn increment_attempts(&self, _: &str) -> Result<u32, StoreError> {
            Err(StoreError::Io(std::io::Error::other("connection reset")))
        }
        async fn reschedule(&self, job_id: &str, run_at: i64) -> Result<(), StoreError> {
            self.0.reschedule(job_id, run_at).await
        }
        async fn remove_job(&self, job_id: &str) -> Result<(), StoreError> {
            self.0.remove_job(job_id).await
        }
        async fn is_event_processed(&self, event_id: &str) -> Result<bool, StoreError> {
            self.0.is_event_processed(event_id).await
        }
        async fn mark_event_processed(&self, event_id: &str, now: i64) -> Result<(), StoreError> {
            self.0.mark_event_processed(event_id, now).await
        }
        async fn purge_processed(&self, older_than: i64) -> Result<u64, StoreError> {
            self.0.purge_processed(older_than).await
        }
        async fn stats(&self, now: i64) -> Result<JobStats, StoreError> {
            self.0.stats(now).await
        }
        async fn processed_count(&self) -> Result<u64, StoreError> {
            self.0.processed_count().await
        }
    }

    #[tokio::test]
    async fn unrecorded_attempt_leaves_job_due() {
        let db = RelayDatabase::open_in_memory().await.unwrap();
        let clock = Arc::new(ManualClock::new(NOW));
        let metrics = Arc::new(Metrics::new());
        let store = JobStore::new(
            Arc::new(NoAttempts(SqliteJobBackend::new(db))),
            StoreSettings::default(),
            clock.clone(),
            metrics.clone(),
        );
        let driver = Arc::new(DryRunDriver::new());
        driver.set_unreachable("R1", true);
        let actions = Arc::new(ActionHandler::new(
            driver,
            Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default())),
            metrics.clone(),
            &[RouterConfig::new("R1", "10.10.0.1")],
        ));
        let machine = Arc::new(StateMachine::new(
            store.clone(),
            actions.clone(),
            clock.clone(),
            metrics.clone(),
            MachineSettings::default(),
        ));
        let runner = JobRunner::new(
            store.clone(),
            machine,
            actions,
            clock,
            metrics.clone(),
            policy(),
        );

        let job = Job::new(
            JobKind::RevokeTrial,
            Some("e1"),
            NOW,
            json!({"routerId": "R1", "ip": "10.0.0.5", "mac": "AA:BB:CC:DD:EE:FF"}),
            NOW,
        );
        store.add_job(&job).await.unwrap();

        let tick = runner.run_due_jobs().await;
        assert_eq!(tick.failed, 1);
        assert_eq!(tick.gave_up, 0);
        let stored = store.get_job(&job.id).await.unwrap();
        assert_eq!(stored.attempts, 0);
        assert_eq!(stored.run_at, NOW);
        assert_eq!(metrics.get("job.REVOKE_TRIAL.failed"), 0);
    }

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            base_ms: 1_000,
            jitter_cap_ms: 5_000,
            max_attempts: 5,
        }
    }

    #[test]
    fn base_delay_doubles() {
        let p = policy();
        assert_eq!(p.base_delay_ms(1), 1_000);
        assert_eq!(p.base_delay_ms(2), 2_000);
        assert_eq!(p.base_delay_ms(4), 8_000);
        assert_eq!(p.base_delay_ms(200), u64::MAX);
    }

    #[test]
    fn delays_never_decrease() {
        let p = policy();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let mut previous = 0;
            for attempts in 1..p.max_attempts {
                let delay = p.delay_ms(attempts, &mut rng);
                assert!(delay >= previous, "attempt {attempts}: {delay} < {previous}");
                assert!(delay < p.base_delay_ms(attempts) * 2);
                previous = delay;
            }
        }
    }

    #[test]
    fn jitter_is_capped() {
        let p = policy();
        assert_eq!(p.jitter_bound_ms(1), 1_000);
        assert_eq!(p.jitter_bound_ms(5), 5_000);
        let zero = BackoffPolicy {
            jitter_cap_ms: 0,
            ..p
        };
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(zero.delay_ms(3, &mut rng), 4_000);
    }

    #[test]
    fn exhaustion_at_max_attempts() {
        let p = policy();
        assert!(!p.exhausted(4));
        assert!(p.exhausted(5));
    }
}
