//! Job store shared between relay instances through Redis.
//!
//! Key layout under the configured namespace `ns`:
//! - `ns:jobs`             sorted set of job ids scored by `run_at`
//! - `ns:job:<id>`         hash with the job fields
//! - `ns:lock:<id>`        lease value (`SET NX PX`)
//! - `ns:processed_events` sorted set of event ids scored by processed time

use std::collections::HashMap;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::{info, warn};

use super::{Job, JobBackend, JobStats, StoreError};

/// Deletes the lease only while it still carries the caller's holder id.
const RELEASE_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
";

/// Increments attempts on an existing job; -1 when the job is gone.
const INCREMENT_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return redis.call('HINCRBY', KEYS[1], 'attempts', 1)
end
return -1
";

/// Moves an existing job to a new run time in both its hash and the due
/// index; 0 when the job is gone.
const RESCHEDULE_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return 0
end
redis.call('HSET', KEYS[1], 'runAt', ARGV[1])
redis.call('ZADD', KEYS[2], ARGV[1], ARGV[2])
return 1
";

#[derive(Clone)]
pub struct RedisJobBackend {
    conn: ConnectionManager,
    namespace: String,
}

impl RedisJobBackend {
    /// Connect to Redis. The connection manager reconnects on its own after
    /// transient failures.
    pub async fn connect(url: &str, namespace: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        info!(namespace, "Redis job store connected");
        Ok(Self {
            conn,
            namespace: namespace.to_string(),
        })
    }

    fn jobs_key(&self) -> String {
        format!("{}:jobs", self.namespace)
    }

    fn job_key(&self, id: &str) -> String {
        format!("{}:job:{id}", self.namespace)
    }

    fn lock_key(&self, id: &str) -> String {
        format!("{}:lock:{id}", self.namespace)
    }

    fn processed_key(&self) -> String {
        format!("{}:processed_events", self.namespace)
    }

    async fn load(&self, id: &str) -> Result<Option<Job>, StoreError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(self.job_key(id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        decode_job(id, &fields).map(Some)
    }
}

fn encode_job(job: &Job) -> Result<Vec<(&'static str, String)>, StoreError> {
    Ok(vec![
        ("id", job.id.clone()),
        ("type", job.kind.as_str().to_string()),
        (
            "originEventId",
            job.origin_event_id.clone().unwrap_or_default(),
        ),
        ("runAt", job.run_at.to_string()),
        ("payload", serde_json::to_string(&job.payload)?),
        ("attempts", job.attempts.to_string()),
        ("createdAt", job.created_at.to_string()),
    ])
}

fn decode_job(id: &str, fields: &HashMap<String, String>) -> Result<Job, StoreError> {
    let corrupt = |reason: String| StoreError::Corrupt {
        id: id.to_string(),
        reason,
    };
    let field = |name: &str| {
        fields
            .get(name)
            .ok_or_else(|| corrupt(format!("missing field {name}")))
    };
    let int = |name: &str| -> Result<i64, StoreError> {
        field(name)?
            .parse()
            .map_err(|_| corrupt(format!("field {name} is not an integer")))
    };

    Ok(Job {
        id: id.to_string(),
        kind: field("type")?.parse().map_err(corrupt)?,
        origin_event_id: fields
            .get("originEventId")
            .filter(|v| !v.is_empty())
            .cloned(),
        run_at: int("runAt")?,
        payload: serde_json::from_str(field("payload")?)
            .map_err(|e| corrupt(e.to_string()))?,
        attempts: u32::try_from(int("attempts")?).unwrap_or(0),
        created_at: int("createdAt")?,
    })
}

#[async_trait]
impl JobBackend for RedisJobBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn add_job(&self, job: &Job) -> Result<(), StoreError> {
        let fields = encode_job(job)?;
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .hset_multiple(self.job_key(&job.id), &fields)
            .ignore()
            .zadd(self.jobs_key(), &job.id, job.run_at)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn due_jobs(&self, now: i64, limit: usize) -> Result<Vec<Job>, StoreError> {
        let mut conn = self.conn.clone();
        let count = isize::try_from(limit).unwrap_or(isize::MAX);
        let ids: Vec<String> = conn
            .zrangebyscore_limit(self.jobs_key(), "-inf", now, 0, count)
            .await?;

        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            match self.load(&id).await {
                Ok(Some(job)) => jobs.push(job),
                Ok(None) => {
                    // Index entry without a hash: the job was removed mid-read.
                    let _: i64 = conn.zrem(self.jobs_key(), &id).await?;
                }
                Err(e) => warn!(job_id = %id, error = %e, "Skipping unreadable job"),
            }
        }
        Ok(jobs)
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>, StoreError> {
        self.load(job_id).await
    }

    async fn acquire_lock(
        &self,
        job_id: &str,
        holder: &str,
        ttl_ms: u64,
        _now: i64,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.lock_key(job_id))
            .arg(holder)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms.max(1))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn release_lock(&self, job_id: &str, holder: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: i64 = Script::new(RELEASE_SCRIPT)
            .key(self.lock_key(job_id))
            .arg(holder)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn increment_attempts(&self, job_id: &str) -> Result<u32, StoreError> {
        let mut conn = self.conn.clone();
        let attempts: i64 = Script::new(INCREMENT_SCRIPT)
            .key(self.job_key(job_id))
            .invoke_async(&mut conn)
            .await?;
        if attempts < 0 {
            return Err(StoreError::NotFound(job_id.to_string()));
        }
        Ok(u32::try_from(attempts).unwrap_or(u32::MAX))
    }

    async fn reschedule(&self, job_id: &str, run_at: i64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let found: i64 = Script::new(RESCHEDULE_SCRIPT)
            .key(self.job_key(job_id))
            .key(self.jobs_key())
            .arg(run_at)
            .arg(job_id)
            .invoke_async(&mut conn)
            .await?;
        if found == 0 {
            return Err(StoreError::NotFound(job_id.to_string()));
        }
        Ok(())
    }

    async fn remove_job(&self, job_id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .zrem(self.jobs_key(), job_id)
            .ignore()
            .del(self.job_key(job_id))
            .ignore()
            .del(self.lock_key(job_id))
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn is_event_processed(&self, event_id: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let score: Option<f64> = conn.zscore(self.processed_key(), event_id).await?;
        Ok(score.is_some())
    }

    async fn mark_event_processed(&self, event_id: &str, now: i64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("ZADD")
            .arg(self.processed_key())
            .arg("NX")
            .arg(now)
            .arg(event_id)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn purge_processed(&self, older_than: i64) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let removed: u64 = redis::cmd("ZREMRANGEBYSCORE")
            .arg(self.processed_key())
            .arg("-inf")
            .arg(format!("({older_than}"))
            .query_async(&mut conn)
            .await?;
        Ok(removed)
    }

    #[allow(clippy::cast_possible_truncation)]
    async fn stats(&self, now: i64) -> Result<JobStats, StoreError> {
        let mut conn = self.conn.clone();
        let total: u64 = conn.zcard(self.jobs_key()).await?;
        let due: u64 = conn.zcount(self.jobs_key(), "-inf", now).await?;
        let oldest: Vec<String> = conn.zrange(self.jobs_key(), 0, 0).await?;
        let oldest_run_at = match oldest.first() {
            Some(id) => {
                let score: Option<f64> = conn.zscore(self.jobs_key(), id).await?;
                score.map(|s| s as i64)
            }
            None => None,
        };
        Ok(JobStats::from_counts(total, due, oldest_run_at))
    }

    async fn processed_count(&self) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let count: u64 = conn.zcard(self.processed_key()).await?;
        Ok(count)
    }
}
