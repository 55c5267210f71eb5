//! Audit trail for actions and event processing.
//!
//! Records go to the `audit` tracing target so they can be routed to their
//! own sink with `RUST_LOG=audit=info`. Payloads are redacted before they
//! are formatted.

use netgate_core::tracing_init::AUDIT_TARGET;
use serde_json::Value;
use tracing::{info, warn};

const REDACTED: &str = "[REDACTED]";

/// Key fragments that mark a value as secret.
const SECRET_MARKERS: &[&str] = &[
    "password",
    "pass",
    "secret",
    "token",
    "key",
    "hmac",
    "authorization",
    "credential",
];

fn is_secret_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    SECRET_MARKERS.iter().any(|marker| key.contains(marker))
}

/// Copy of `value` with every secret-looking field replaced.
pub fn redact(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    let v = if is_secret_key(k) {
                        Value::String(REDACTED.to_string())
                    } else {
                        redact(v)
                    };
                    (k.clone(), v)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact).collect()),
        other => other.clone(),
    }
}

/// Stage of an audited operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Attempt,
    Success,
    Fail,
}

impl Outcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Attempt => "attempt",
            Self::Success => "success",
            Self::Fail => "fail",
        }
    }
}

/// Emit one audit record.
pub fn record(outcome: Outcome, stage: &str, trace_id: &str, detail: &Value) {
    let detail = redact(detail);
    match outcome {
        Outcome::Fail => warn!(
            target: AUDIT_TARGET,
            outcome = outcome.as_str(),
            stage,
            trace_id,
            detail = %detail,
            "audit"
        ),
        Outcome::Attempt | Outcome::Success => info!(
            target: AUDIT_TARGET,
            outcome = outcome.as_str(),
            stage,
            trace_id,
            detail = %detail,
            "audit"
        ),
    }
}

pub fn attempt(stage: &str, trace_id: &str, detail: &Value) {
    record(Outcome::Attempt, stage, trace_id, detail);
}

pub fn success(stage: &str, trace_id: &str, detail: &Value) {
    record(Outcome::Success, stage, trace_id, detail);
}

pub fn fail(stage: &str, trace_id: &str, detail: &Value) {
    record(Outcome::Fail, stage, trace_id, detail);
}
