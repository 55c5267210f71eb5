//! Event consumer: pulls batches from an [`EventSource`], runs each event
//! through the state machine and acknowledges the outcome.

mod ack;
mod source;

use std::sync::Arc;
use std::time::Duration;

use netgate_core::Metrics;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::machine::{Event, Reason, StateMachine};

pub use ack::{Ack, Acknowledger, HttpAcknowledger};
pub use source::{
    BACKEND_HMAC_HEADER, EventSource, FileQueueSource, HttpEventSource, RELAY_HMAC_HEADER,
    SourceError, TS_HEADER, unwrap_batch,
};

/// Counts from one poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub fetched: usize,
    pub processed: usize,
    pub duplicates: usize,
    pub invalid: usize,
    pub failed: usize,
}

/// Check the envelope of a raw event before it reaches the state machine.
pub fn parse_event(raw: Value) -> Result<Event, String> {
    let Value::Object(map) = &raw else {
        return Err("event must be an object".to_string());
    };
    match map.get("eventId") {
        Some(Value::String(id)) if !id.trim().is_empty() => {}
        _ => return Err("eventId must be a non-empty string".to_string()),
    }
    if !matches!(map.get("type"), Some(Value::String(_))) {
        return Err("type must be a string".to_string());
    }
    if !matches!(map.get("payload"), None | Some(Value::Object(_) | Value::Null)) {
        return Err("payload must be an object".to_string());
    }
    serde_json::from_value(raw).map_err(|e| e.to_string())
}

pub struct EventConsumer {
    source: Arc<dyn EventSource>,
    ack: Option<Arc<dyn Acknowledger>>,
    machine: Arc<StateMachine>,
    metrics: Arc<Metrics>,
}

impl EventConsumer {
    pub fn new(
        source: Arc<dyn EventSource>,
        ack: Option<Arc<dyn Acknowledger>>,
        machine: Arc<StateMachine>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            source,
            ack,
            machine,
            metrics,
        }
    }

    /// Fetch and process one batch. Source errors are logged and yield an
    /// empty summary.
    pub async fn poll_once(&self) -> PollSummary {
        let batch = match self.source.fetch().await {
            Ok(batch) => batch,
            Err(e) => {
                warn!(source = self.source.name(), error = %e, "Event fetch failed");
                return PollSummary::default();
            }
        };
        let mut summary = PollSummary {
            fetched: batch.len(),
            ..PollSummary::default()
        };

        for raw in batch {
            let event_id = raw
                .get("eventId")
                .and_then(Value::as_str)
                .map(str::to_string);
            let event = match parse_event(raw) {
                Ok(event) => event,
                Err(reason) => {
                    self.metrics.inc("events.invalid");
                    warn!(event_id = ?event_id, reason, "Malformed event dropped");
                    summary.invalid += 1;
                    if let Some(event_id) = event_id {
                        self.acknowledge(
                            event_id,
                            false,
                            json!({ "reason": Reason::Validation, "error": reason }),
                        )
                        .await;
                    }
                    continue;
                }
            };

            let outcome = self.machine.process_event(&event).await;
            match outcome.reason {
                Some(Reason::Duplicate) => summary.duplicates += 1,
                Some(Reason::Validation | Reason::UnknownType) => summary.invalid += 1,
                _ if outcome.ok => summary.processed += 1,
                _ => summary.failed += 1,
            }
            let payload = serde_json::to_value(&outcome).unwrap_or(Value::Null);
            self.acknowledge(event.event_id, outcome.ok, payload).await;
        }

        if summary.fetched > 0 {
            info!(
                source = self.source.name(),
                fetched = summary.fetched,
                processed = summary.processed,
                duplicates = summary.duplicates,
                invalid = summary.invalid,
                failed = summary.failed,
                "Event batch consumed"
            );
        }
        summary
    }

    async fn acknowledge(&self, event_id: String, ok: bool, payload: Value) {
        if let Some(ack) = &self.ack {
            ack.ack(&Ack {
                event_id,
                ok,
                payload,
            })
            .await;
        }
    }
}

/// Spawn the polling loop, running every `interval` until `shutdown` fires.
pub fn spawn_consumer_task(
    consumer: Arc<EventConsumer>,
    interval: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = timer.tick() => {
                    consumer.poll_once().await;
                }
                _ = shutdown.changed() => {
                    info!("Event consumer shutting down");
                    return;
                }
            }
        }
    })
}
