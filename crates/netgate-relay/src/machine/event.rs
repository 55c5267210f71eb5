//! Inbound events and processing outcomes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event types the state machine acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    TrialRequested,
    ReleaseRequested,
    RevokeRequested,
}

impl EventType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TrialRequested => "TRIAL_REQUESTED",
            Self::ReleaseRequested => "RELEASE_REQUESTED",
            Self::RevokeRequested => "REVOKE_REQUESTED",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TRIAL_REQUESTED" => Ok(Self::TrialRequested),
            "RELEASE_REQUESTED" => Ok(Self::ReleaseRequested),
            "REVOKE_REQUESTED" => Ok(Self::RevokeRequested),
            other => Err(other.to_string()),
        }
    }
}

/// An externally sourced instruction. Missing fields deserialize as empty
/// so that the state machine, not serde, decides what is invalid.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(default)]
    pub event_id: String,
    #[serde(default, rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

impl Event {
    pub fn new(event_id: &str, event_type: EventType, payload: Value) -> Self {
        Self {
            event_id: event_id.to_string(),
            event_type: event_type.as_str().to_string(),
            payload,
            timestamp: None,
        }
    }
}

/// Why an event did not complete normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    Validation,
    CircuitOpen,
    UnknownType,
    PeerOffline,
    Duplicate,
    DriverError,
    StoreUnavailable,
}

impl Reason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::CircuitOpen => "circuit_open",
            Self::UnknownType => "unknown_type",
            Self::PeerOffline => "peer_offline",
            Self::Duplicate => "duplicate",
            Self::DriverError => "driver_error",
            Self::StoreUnavailable => "store_unavailable",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of [`StateMachine::process_event`](super::StateMachine::process_event).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessOutcome {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<Reason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProcessOutcome {
    pub const fn ok() -> Self {
        Self {
            ok: true,
            reason: None,
            error: None,
        }
    }

    pub const fn duplicate() -> Self {
        Self {
            ok: true,
            reason: Some(Reason::Duplicate),
            error: None,
        }
    }

    pub fn rejected(reason: Reason, error: impl Into<String>) -> Self {
        Self {
            ok: false,
            reason: Some(reason),
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn event_tolerates_missing_fields() {
        let event: Event = serde_json::from_value(json!({"payload": {"ip": "10.0.0.1"}})).unwrap();
        assert!(event.event_id.is_empty());
        assert!(event.event_type.is_empty());
        assert_eq!(event.payload["ip"], "10.0.0.1");
    }

    #[test]
    fn outcome_serializes_reason() {
        let value =
            serde_json::to_value(ProcessOutcome::rejected(Reason::CircuitOpen, "R1")).unwrap();
        assert_eq!(value["ok"], false);
        assert_eq!(value["reason"], "circuit_open");
        assert_eq!(
            serde_json::to_value(ProcessOutcome::ok()).unwrap(),
            json!({"ok": true})
        );
    }
}
