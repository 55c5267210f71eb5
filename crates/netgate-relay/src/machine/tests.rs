#![allow(clippy::unwrap_used)]

use std::sync::Arc;

use netgate_core::config::RouterConfig;
use netgate_core::{ManualClock, Metrics};
use serde_json::json;

use super::*;
use crate::audit;
use crate::circuit::{CircuitBreaker, CircuitBreakerConfig};
use crate::driver::{DryRunDriver, RouterCommand};
use crate::jobs::{SqliteJobBackend, StoreSettings};
use crate::overlay::{ActualPeer, MemoryOverlay};
use crate::storage::RelayDatabase;

const NOW: i64 = 1_700_000_000_000;

struct Fixture {
    machine: StateMachine,
    driver: Arc<DryRunDriver>,
    store: JobStore,
    clock: Arc<ManualClock>,
    metrics: Arc<Metrics>,
    circuit: Arc<CircuitBreaker>,
}

async fn fixture() -> Fixture {
    let db = RelayDatabase::open_in_memory().await.unwrap();
    let clock = Arc::new(ManualClock::new(NOW));
    let metrics = Arc::new(Metrics::new());
    let store = JobStore::new(
        Arc::new(SqliteJobBackend::new(db)),
        StoreSettings::default(),
        clock.clone(),
        metrics.clone(),
    );
    let driver = Arc::new(DryRunDriver::new());
    let circuit = Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
        failure_threshold: 1,
        ..CircuitBreakerConfig::default()
    }));
    let actions = Arc::new(ActionHandler::new(
        driver.clone(),
        circuit.clone(),
        metrics.clone(),
        &[RouterConfig::new("R1", "10.10.0.1")],
    ));
    let machine = StateMachine::new(
        store.clone(),
        actions,
        clock.clone(),
        metrics.clone(),
        MachineSettings {
            default_trial_minutes: 5,
            retry_delay_ms: 30_000,
            offline_max_age_secs: 300,
        },
    );
    Fixture {
        machine,
        driver,
        store,
        clock,
        metrics,
        circuit,
    }
}

fn trial(event_id: &str) -> Event {
    Event::new(
        event_id,
        EventType::TrialRequested,
        json!({
            "pedidoId": "p1",
            "routerId": "R1",
            "ip": "10.0.0.5",
            "mac": "AA:BB:CC:DD:EE:FF",
        }),
    )
}

async fn all_jobs(store: &JobStore) -> Vec<Job> {
    store.get_due_jobs(i64::MAX).await
}

#[tokio::test]
async fn trial_grants_and_schedules_expiry() {
    let f = fixture().await;
    let outcome = f.machine.process_event(&trial("e1")).await;
    assert_eq!(outcome, ProcessOutcome::ok());

    assert_eq!(f.driver.commands_for("R1").len(), 4);
    let jobs = all_jobs(&f.store).await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].kind, JobKind::RevokeTrial);
    assert_eq!(jobs[0].run_at, NOW + 300_000);
    assert_eq!(jobs[0].origin_event_id.as_deref(), Some("e1"));
    assert_eq!(jobs[0].payload["mac"], "AA:BB:CC:DD:EE:FF");
    assert!(f.store.is_event_processed("e1").await);
    assert_eq!(f.metrics.get("trial.granted"), 1);
}

#[tokio::test]
async fn trial_minutes_come_from_payload() {
    let f = fixture().await;
    let mut event = trial("e1");
    event.payload["trialMinutes"] = json!(10);
    f.machine.process_event(&event).await;
    assert_eq!(all_jobs(&f.store).await[0].run_at, NOW + 600_000);
}

#[tokio::test]
async fn malformed_trial_is_rejected_without_side_effects() {
    let f = fixture().await;
    let mut event = trial("e1");
    event.payload.as_object_mut().unwrap().remove("mac");

    let outcome = f.machine.process_event(&event).await;
    assert!(!outcome.ok);
    assert_eq!(outcome.reason, Some(Reason::Validation));
    assert!(all_jobs(&f.store).await.is_empty());
    assert!(f.driver.batches().is_empty());
    assert!(f.store.is_event_processed("e1").await);
}

#[tokio::test]
async fn missing_event_id_is_validation() {
    let f = fixture().await;
    let outcome = f.machine.process_event(&trial("")).await;
    assert_eq!(outcome.reason, Some(Reason::Validation));
    assert_eq!(f.metrics.get("events.invalid"), 1);
}

#[tokio::test]
async fn unknown_router_is_validation() {
    let f = fixture().await;
    let mut event = trial("e1");
    event.payload["routerId"] = json!("R404");
    let outcome = f.machine.process_event(&event).await;
    assert_eq!(outcome.reason, Some(Reason::Validation));
    assert!(f.driver.batches().is_empty());
}

#[tokio::test]
async fn unknown_type_is_recorded_and_ignored() {
    let f = fixture().await;
    let event = Event {
        event_id: "e1".into(),
        event_type: "REFUND_REQUESTED".into(),
        payload: json!({}),
        timestamp: None,
    };
    let outcome = f.machine.process_event(&event).await;
    assert_eq!(outcome.reason, Some(Reason::UnknownType));
    assert!(f.store.is_event_processed("e1").await);
    assert!(f.driver.batches().is_empty());
}

#[tokio::test]
async fn same_event_id_runs_once() {
    let f = fixture().await;
    assert!(f.machine.process_event(&trial("e1")).await.ok);
    let second = f.machine.process_event(&trial("e1")).await;
    assert!(second.ok);
    assert_eq!(second.reason, Some(Reason::Duplicate));
    assert_eq!(f.driver.batches().len(), 1);
    assert_eq!(all_jobs(&f.store).await.len(), 1);
}

#[tokio::test]
async fn duplicate_revoke_by_ip_is_free() {
    let f = fixture().await;
    for id in ["r1", "r2"] {
        let event = Event::new(
            id,
            EventType::RevokeRequested,
            json!({"routerId": "R1", "ip": "10.0.0.9"}),
        );
        assert!(f.machine.process_event(&event).await.ok);
    }
    let removals = f
        .driver
        .commands_for("R1")
        .into_iter()
        .filter(|c| matches!(c, RouterCommand::RemoveAddressList { address, .. } if address == "10.0.0.9"))
        .count();
    assert_eq!(removals, 2);
    assert_eq!(f.metrics.get("revoke.done"), 2);
}

#[tokio::test]
async fn driver_failure_schedules_retry_and_marks_processed() {
    let f = fixture().await;
    f.driver.set_unreachable("R1", true);
    let event = Event::new(
        "e1",
        EventType::ReleaseRequested,
        json!({"pedidoId": "p1", "routerId": "R1", "ip": "10.0.0.5", "mac": "AA:BB:CC:DD:EE:FF"}),
    );

    let outcome = f.machine.process_event(&event).await;
    assert_eq!(outcome.reason, Some(Reason::DriverError));
    assert!(f.store.is_event_processed("e1").await);

    let jobs = all_jobs(&f.store).await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].kind, JobKind::RetryEvent);
    assert_eq!(jobs[0].run_at, NOW + 30_000);
    let replay: Event = serde_json::from_value(jobs[0].payload.clone()).unwrap();
    assert_eq!(replay, event);
}

#[tokio::test]
async fn open_circuit_defers_without_marking() {
    let f = fixture().await;
    f.circuit.record_failure("R1");

    let outcome = f.machine.process_event(&trial("e1")).await;
    assert_eq!(outcome.reason, Some(Reason::CircuitOpen));
    assert!(!f.store.is_event_processed("e1").await);
    assert!(all_jobs(&f.store).await.is_empty());
    assert!(f.driver.batches().is_empty());
}

#[tokio::test]
async fn replay_skips_dedup_and_rearms_trial_expiry() {
    let f = fixture().await;
    let event = trial("e1");
    f.store.mark_event_processed("e1").await.unwrap();
    f.clock.advance(120_000);

    assert_eq!(f.machine.replay_event(&event).await, ProcessOutcome::ok());
    let jobs = all_jobs(&f.store).await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].kind, JobKind::RevokeTrial);
    assert_eq!(jobs[0].run_at, NOW + 120_000 + 300_000);

    f.driver.set_unreachable("R1", true);
    f.circuit.record_success("R1");
    let failed = f.machine.replay_event(&event).await;
    assert_eq!(failed.reason, Some(Reason::DriverError));
    assert_eq!(all_jobs(&f.store).await.len(), 1);
}

#[tokio::test]
async fn replayed_release_schedules_nothing() {
    let f = fixture().await;
    let event = Event::new(
        "e1",
        EventType::ReleaseRequested,
        json!({"pedidoId": "p1", "routerId": "R1", "ip": "10.0.0.5", "mac": "AA:BB:CC:DD:EE:FF"}),
    );
    assert!(f.machine.replay_event(&event).await.ok);
    assert!(all_jobs(&f.store).await.is_empty());
}

#[tokio::test]
async fn offline_peer_defers_event() {
    let f = fixture().await;
    let overlay = Arc::new(MemoryOverlay::new());
    let key = "xTIBA5rboUvnH4htodjb6e697QjLERt1NAB4mZqp8Dg=";
    overlay.insert(ActualPeer {
        public_key: key.to_string(),
        allowed_addresses: "10.200.1.1/32".to_string(),
        endpoint: None,
        last_handshake_epoch: NOW / 1000 - 3_600,
        rx_bytes: 0,
        tx_bytes: 0,
    });
    let machine = StateMachine {
        overlay: Some(overlay.clone()),
        ..f.machine
    };

    let mut event = trial("e1");
    event.payload["peerPublicKey"] = json!(key);
    let outcome = machine.process_event(&event).await;
    assert_eq!(outcome.reason, Some(Reason::PeerOffline));
    assert!(!f.store.is_event_processed("e1").await);

    overlay.set_handshake(key, NOW / 1000 - 10);
    assert!(machine.process_event(&event).await.ok);
}

#[tokio::test]
async fn never_connected_peer_passes_gate() {
    let f = fixture().await;
    let overlay = Arc::new(MemoryOverlay::new());
    let key = "xTIBA5rboUvnH4htodjb6e697QjLERt1NAB4mZqp8Dg=";
    overlay.insert(ActualPeer {
        public_key: key.to_string(),
        allowed_addresses: "10.200.1.1/32".to_string(),
        endpoint: None,
        last_handshake_epoch: 0,
        rx_bytes: 0,
        tx_bytes: 0,
    });
    let machine = f.machine.with_overlay(overlay);

    let event = Event::new(
        "e1",
        EventType::ReleaseRequested,
        json!({
            "pedidoId": "p1",
            "routerId": "R1",
            "ip": "10.0.0.5",
            "mac": "AA:BB:CC:DD:EE:FF",
            "peerPublicKey": key,
        }),
    );
    assert_eq!(machine.process_event(&event).await, ProcessOutcome::ok());
    assert_eq!(f.metrics.get("events.rejected_peer_offline"), 0);
}

#[tokio::test]
async fn overlay_errors_never_block() {
    let f = fixture().await;
    let overlay = Arc::new(MemoryOverlay::new());
    overlay.set_failing(true);
    let machine = f.machine.with_overlay(overlay);

    let mut event = trial("e1");
    event.payload["peerPublicKey"] = json!("xTIBA5rboUvnH4htodjb6e697QjLERt1NAB4mZqp8Dg=");
    assert!(machine.process_event(&event).await.ok);
}

#[tokio::test]
async fn clock_drives_trial_schedule() {
    let f = fixture().await;
    f.clock.advance(60_000);
    f.machine.process_event(&trial("e1")).await;
    assert_eq!(all_jobs(&f.store).await[0].run_at, NOW + 360_000);
}

#[tokio::test]
async fn stages_are_audited_in_order() {
    let f = fixture().await;
    let (log, _guard) = audit::capture::install();

    assert!(f.machine.process_event(&trial("e1")).await.ok);
    let stages: Vec<(String, String)> = log
        .records()
        .into_iter()
        .filter(|(stage, _)| stage != "action")
        .collect();
    let expected = [
        ("RECEIVED", "attempt"),
        ("VALIDATED", "success"),
        ("EXECUTING", "attempt"),
        ("EXECUTED", "success"),
    ];
    assert_eq!(
        stages,
        expected.map(|(s, o)| (s.to_string(), o.to_string()))
    );
}

#[tokio::test]
async fn failed_execution_is_audited() {
    let f = fixture().await;
    f.driver.set_unreachable("R1", true);
    let (log, _guard) = audit::capture::install();

    let event = Event::new(
        "e1",
        EventType::RevokeRequested,
        json!({"routerId": "R1", "ip": "10.0.0.9"}),
    );
    assert!(!f.machine.process_event(&event).await.ok);
    assert_eq!(log.outcomes("EXECUTING"), ["attempt"]);
    assert_eq!(log.outcomes("EXEC_FAILED"), ["fail"]);
    assert!(log.outcomes("EXECUTED").is_empty());
}
