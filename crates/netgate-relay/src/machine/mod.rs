//! Event state machine.
//!
//! Turns inbound events into router actions and follow-up jobs. Every
//! event is keyed by `eventId`: once it has completed, later deliveries of
//! the same id are acknowledged without side effects.

mod event;

use std::sync::Arc;

use netgate_core::config::Config;
use netgate_core::{Clock, Metrics};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::actions::{
    ActionErrorCode, ActionHandler, ActionKind, ActionRequest, GrantTarget, RevokeTarget, router_field,
};
use crate::audit;
use crate::jobs::{Job, JobKind, JobStore};
use crate::overlay::{OverlayDriver, PeerStatus, peer_status};

pub use event::{Event, EventType, ProcessOutcome, Reason};

/// Tunables for [`StateMachine`].
#[derive(Debug, Clone)]
pub struct MachineSettings {
    pub default_trial_minutes: u32,
    pub retry_delay_ms: u64,
    /// Reject events for peers silent longer than this; 0 disables the gate.
    pub offline_max_age_secs: u64,
}

impl From<&Config> for MachineSettings {
    fn from(config: &Config) -> Self {
        Self {
            default_trial_minutes: config.events.default_trial_minutes,
            retry_delay_ms: config.jobs.retry_delay_ms,
            offline_max_age_secs: config.events.offline_max_age_secs,
        }
    }
}

impl Default for MachineSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

/// How a dispatch is being run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// First delivery: schedules trial expiry and retries itself.
    Live,
    /// Replay from a `RETRY_EVENT` job: the runner owns retries.
    Replay,
}

/// Validated, dispatchable form of an event.
enum Dispatch {
    Trial(GrantTarget),
    Release(GrantTarget),
    Revoke(RevokeTarget),
}

impl Dispatch {
    fn router_id(&self) -> &str {
        match self {
            Self::Trial(t) | Self::Release(t) => &t.router_id,
            Self::Revoke(t) => &t.router_id,
        }
    }
}

pub struct StateMachine {
    store: JobStore,
    actions: Arc<ActionHandler>,
    overlay: Option<Arc<dyn OverlayDriver>>,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
    settings: MachineSettings,
}

impl StateMachine {
    pub fn new(
        store: JobStore,
        actions: Arc<ActionHandler>,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
        settings: MachineSettings,
    ) -> Self {
        Self {
            store,
            actions,
            overlay: None,
            clock,
            metrics,
            settings,
        }
    }

    /// Enable the peer-offline gate against `overlay`.
    #[must_use]
    pub fn with_overlay(mut self, overlay: Arc<dyn OverlayDriver>) -> Self {
        self.overlay = Some(overlay);
        self
    }

    pub const fn store(&self) -> &JobStore {
        &self.store
    }

    /// Process one delivery of an event.
    pub async fn process_event(&self, event: &Event) -> ProcessOutcome {
        self.metrics.inc("events.received");
        audit::attempt(
            "RECEIVED",
            &event.event_id,
            &json!({ "type": event.event_type, "payload": event.payload }),
        );
        if event.event_id.is_empty() {
            self.metrics.inc("events.invalid");
            audit::fail("VALIDATION_FAIL", "", &json!({ "error": "eventId required" }));
            return ProcessOutcome::rejected(Reason::Validation, "eventId required");
        }

        if self.store.is_event_processed(&event.event_id).await {
            self.metrics.inc("events.duplicate");
            audit::success("DUPLICATE", &event.event_id, &Value::Null);
            debug!(event_id = %event.event_id, "Duplicate event skipped");
            return ProcessOutcome::duplicate();
        }

        let dispatch = match self.validate(event) {
            Ok(dispatch) => dispatch,
            Err(outcome) => {
                self.finish(&event.event_id).await;
                return outcome;
            }
        };

        if let Some(outcome) = self.gate(event, &dispatch).await {
            return outcome;
        }

        if let Dispatch::Trial(target) = &dispatch {
            if let Err(e) = self.schedule_trial_expiry(event, target).await {
                self.metrics.inc("events.error");
                warn!(event_id = %event.event_id, error = %e, "Could not schedule trial expiry");
                return ProcessOutcome::rejected(Reason::StoreUnavailable, e.to_string());
            }
        }

        let outcome = self.dispatch(event, &dispatch, Mode::Live).await;
        if outcome.reason == Some(Reason::DriverError) {
            self.schedule_retry(event).await;
        }
        self.finish(&event.event_id).await;
        outcome
    }

    /// Re-run a previously failed event on behalf of a `RETRY_EVENT` job.
    ///
    /// Skips the dedup check; failures are returned to the caller instead of
    /// scheduling another retry. A trial granted here gets a fresh expiry,
    /// since the one scheduled on first delivery may already have run.
    pub async fn replay_event(&self, event: &Event) -> ProcessOutcome {
        let dispatch = match self.validate(event) {
            Ok(dispatch) => dispatch,
            Err(outcome) => return outcome,
        };
        if let Some(outcome) = self.gate(event, &dispatch).await {
            return outcome;
        }
        let outcome = self.dispatch(event, &dispatch, Mode::Replay).await;
        if let (true, Dispatch::Trial(target)) = (outcome.ok, &dispatch) {
            // The runner retries the whole replay; granting again is idempotent.
            if let Err(e) = self.schedule_trial_expiry(event, target).await {
                self.metrics.inc("events.error");
                warn!(event_id = %event.event_id, error = %e, "Could not schedule trial expiry after replay");
                return ProcessOutcome::rejected(Reason::StoreUnavailable, e.to_string());
            }
        }
        outcome
    }

    fn validate(&self, event: &Event) -> Result<Dispatch, ProcessOutcome> {
        let invalid = |msg: String| {
            self.metrics.inc("events.invalid");
            audit::fail("VALIDATION_FAIL", &event.event_id, &json!({ "error": &msg }));
            warn!(event_id = %event.event_id, event_type = %event.event_type, error = %msg, "Invalid event");
            ProcessOutcome::rejected(Reason::Validation, msg)
        };

        if event.event_type.is_empty() {
            return Err(invalid("type required".to_string()));
        }
        if let Some(router_id) = router_field(&event.payload) {
            if self.actions.router(&router_id).is_none() {
                return Err(invalid(format!("unknown router: {router_id}")));
            }
        }

        let Ok(event_type) = event.event_type.parse::<EventType>() else {
            self.metrics.inc("events.unknown_type");
            audit::fail("UNKNOWN_TYPE", &event.event_id, &json!({ "type": event.event_type }));
            info!(event_id = %event.event_id, event_type = %event.event_type, "Unknown event type ignored");
            return Err(ProcessOutcome::rejected(
                Reason::UnknownType,
                format!("unknown event type: {}", event.event_type),
            ));
        };

        let dispatch = match event_type {
            EventType::TrialRequested => GrantTarget::from_payload(&event.payload).map(Dispatch::Trial),
            EventType::ReleaseRequested => {
                GrantTarget::from_payload(&event.payload).map(Dispatch::Release)
            }
            EventType::RevokeRequested => {
                RevokeTarget::from_payload(&event.payload).map(Dispatch::Revoke)
            }
        };
        let dispatch = dispatch.map_err(|e| invalid(e.0))?;
        audit::success("VALIDATED", &event.event_id, &json!({ "type": event.event_type }));
        Ok(dispatch)
    }

    /// Circuit and peer-liveness checks. `Some` short-circuits the event
    /// without marking it processed.
    async fn gate(&self, event: &Event, dispatch: &Dispatch) -> Option<ProcessOutcome> {
        let router_id = dispatch.router_id();
        if !self.actions.circuit().allow_request(router_id) {
            self.metrics.inc("events.rejected_circuit");
            audit::fail("CHECK_ROUTER", &event.event_id, &json!({ "error": "circuit_open" }));
            warn!(event_id = %event.event_id, router_id, "Circuit open, event deferred");
            return Some(ProcessOutcome::rejected(
                Reason::CircuitOpen,
                format!("circuit open for router {router_id}"),
            ));
        }

        let limit = self.settings.offline_max_age_secs;
        let overlay = self.overlay.as_ref()?;
        let key = event.payload.get("peerPublicKey").and_then(Value::as_str)?;
        if limit == 0 {
            return None;
        }
        let peers = match overlay.list_peers().await {
            Ok(peers) => peers,
            Err(e) => {
                debug!(error = %e, "Peer lookup failed, not gating event");
                return None;
            }
        };
        let peer = peers.iter().find(|p| p.public_key == key)?;
        let health = peer_status(peer.last_handshake_epoch, self.clock.now_secs(), limit);
        // Never-connected peers have no handshake age and pass.
        let stale = health.status == PeerStatus::Offline
            && health
                .handshake_age_secs
                .is_some_and(|age| u64::try_from(age).is_ok_and(|age| age > limit));
        if !stale {
            return None;
        }
        self.metrics.inc("events.rejected_peer_offline");
        audit::fail(
            "CHECK_ROUTER",
            &event.event_id,
            &json!({ "error": "peer_offline", "handshakeAgeSecs": health.handshake_age_secs }),
        );
        warn!(
            event_id = %event.event_id,
            router_id,
            handshake_age_secs = ?health.handshake_age_secs,
            "Peer offline, event deferred"
        );
        Some(ProcessOutcome::rejected(
            Reason::PeerOffline,
            "router peer is offline",
        ))
    }

    async fn schedule_trial_expiry(
        &self,
        event: &Event,
        target: &GrantTarget,
    ) -> Result<(), crate::jobs::StoreError> {
        let minutes = event
            .payload
            .get("trialMinutes")
            .and_then(Value::as_u64)
            .filter(|m| *m > 0)
            .unwrap_or_else(|| u64::from(self.settings.default_trial_minutes));
        let now = self.clock.now_ms();
        let run_at = now.saturating_add(i64::try_from(minutes.saturating_mul(60_000)).unwrap_or(i64::MAX));
        let job = Job::new(
            JobKind::RevokeTrial,
            Some(&event.event_id),
            run_at,
            json!({
                "routerId": target.router_id,
                "mac": target.mac,
                "ip": target.ip,
                "pedidoId": target.order_id,
            }),
            now,
        );
        self.store.add_job(&job).await?;
        info!(event_id = %event.event_id, job_id = %job.id, run_at, "Trial expiry scheduled");
        Ok(())
    }

    async fn dispatch(&self, event: &Event, dispatch: &Dispatch, mode: Mode) -> ProcessOutcome {
        let (kind, succeeded, failed) = match dispatch {
            Dispatch::Trial(_) => (ActionKind::AuthorizeBySession, "trial.granted", "trial.failed"),
            Dispatch::Release(_) => (
                ActionKind::AuthorizeBySession,
                "release.granted",
                "release.failed",
            ),
            Dispatch::Revoke(_) => (ActionKind::RevokeSession, "revoke.done", "revoke.failed"),
        };
        let source = match mode {
            Mode::Live => format!("event:{}", event.event_type),
            Mode::Replay => format!("retry:{}", event.event_type),
        };
        audit::attempt("EXECUTING", &event.event_id, &json!({ "action": kind, "source": source }));
        let response = self
            .actions
            .execute(ActionRequest::new(
                kind,
                event.payload.clone(),
                &source,
                &event.event_id,
            ))
            .await;

        if response.ok {
            self.metrics.inc(succeeded);
            audit::success("EXECUTED", &event.event_id, &json!({ "action": kind }));
            return ProcessOutcome::ok();
        }
        self.metrics.inc(failed);
        audit::fail(
            "EXEC_FAILED",
            &event.event_id,
            &json!({ "action": kind, "error": &response.error }),
        );
        let reason = match response.error_code() {
            Some(ActionErrorCode::Validation) => Reason::Validation,
            _ => Reason::DriverError,
        };
        let message = response
            .error
            .map_or_else(|| "action failed".to_string(), |e| e.message);
        ProcessOutcome::rejected(reason, message)
    }

    async fn schedule_retry(&self, event: &Event) {
        let now = self.clock.now_ms();
        let delay = i64::try_from(self.settings.retry_delay_ms).unwrap_or(i64::MAX);
        let payload = match serde_json::to_value(event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(event_id = %event.event_id, error = %e, "Could not encode event for retry");
                return;
            }
        };
        let job = Job::new(
            JobKind::RetryEvent,
            Some(&event.event_id),
            now.saturating_add(delay),
            payload,
            now,
        );
        match self.store.add_job(&job).await {
            Ok(()) => info!(event_id = %event.event_id, job_id = %job.id, "Retry scheduled"),
            Err(e) => {
                self.metrics.inc("events.error");
                warn!(event_id = %event.event_id, error = %e, "Could not schedule retry");
            }
        }
    }

    async fn finish(&self, event_id: &str) {
        if let Err(e) = self.store.mark_event_processed(event_id).await {
            self.metrics.inc("events.error");
            warn!(event_id, error = %e, "Could not mark event processed");
        }
    }
}

#[cfg(test)]
mod tests;
