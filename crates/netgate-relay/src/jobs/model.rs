//! Job data model shared by every backend.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What a job does when it comes due.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobKind {
    /// Revoke a trial grant once its window has elapsed.
    #[serde(rename = "REVOKE_TRIAL")]
    RevokeTrial,
    /// Replay an event whose dispatch failed.
    #[serde(rename = "RETRY_EVENT")]
    RetryEvent,
}

impl JobKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RevokeTrial => "REVOKE_TRIAL",
            Self::RetryEvent => "RETRY_EVENT",
        }
    }

    /// Prefix used for generated job ids.
    const fn id_prefix(self) -> &'static str {
        match self {
            Self::RevokeTrial => "trial",
            Self::RetryEvent => "retry",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "REVOKE_TRIAL" => Ok(Self::RevokeTrial),
            "RETRY_EVENT" => Ok(Self::RetryEvent),
            other => Err(format!("unknown job kind: {other}")),
        }
    }
}

/// A durable, schedulable unit of follow-up work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: JobKind,
    #[serde(default)]
    pub origin_event_id: Option<String>,
    /// Epoch milliseconds at which the job becomes due.
    pub run_at: i64,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub attempts: u32,
    pub created_at: i64,
}

impl Job {
    /// Build a new job with a fresh id.
    pub fn new(
        kind: JobKind,
        origin_event_id: Option<&str>,
        run_at: i64,
        payload: Value,
        now: i64,
    ) -> Self {
        Self {
            id: format!("{}-{}", kind.id_prefix(), uuid::Uuid::new_v4().simple()),
            kind,
            origin_event_id: origin_event_id.map(str::to_string),
            run_at,
            payload,
            attempts: 0,
            created_at: now,
        }
    }

    pub const fn is_due(&self, now: i64) -> bool {
        self.run_at <= now
    }
}

/// Queue depth figures for the metrics endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStats {
    pub total: u64,
    pub due: u64,
    pub pending: u64,
    pub oldest_run_at: Option<i64>,
}

impl JobStats {
    pub fn from_counts(total: u64, due: u64, oldest_run_at: Option<i64>) -> Self {
        Self {
            total,
            due,
            pending: total.saturating_sub(due),
            oldest_run_at,
        }
    }
}
