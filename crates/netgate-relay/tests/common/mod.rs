//! Shared harness: the full relay stack over in-memory storage, a dry-run
//! driver, an in-memory overlay and a manual clock.

#![allow(dead_code, clippy::unwrap_used)]

use std::sync::Arc;

use netgate_core::config::RouterConfig;
use netgate_core::{ManualClock, Metrics};
use serde_json::{Value, json};

use netgate_relay::actions::ActionHandler;
use netgate_relay::circuit::{CircuitBreaker, CircuitBreakerConfig};
use netgate_relay::driver::DryRunDriver;
use netgate_relay::jobs::{Job, JobStore, SqliteJobBackend, StoreSettings};
use netgate_relay::machine::{Event, EventType, MachineSettings, StateMachine};
use netgate_relay::overlay::MemoryOverlay;
use netgate_relay::provision::DeviceManager;
use netgate_relay::reconciler::{Reconciler, ReconcilerSettings};
use netgate_relay::runner::{BackoffPolicy, JobRunner};
use netgate_relay::server::{ApiAuth, AppState, RateLimiter};
use netgate_relay::storage::RelayDatabase;

pub const NOW: i64 = 1_700_000_000_000;
pub const ROUTER: &str = "R1";
pub const TOKEN: &str = "test-token";
pub const API_SECRET: &str = "test-api-secret";

pub struct Harness {
    pub db: RelayDatabase,
    pub clock: Arc<ManualClock>,
    pub metrics: Arc<Metrics>,
    pub store: JobStore,
    pub driver: Arc<DryRunDriver>,
    pub overlay: Arc<MemoryOverlay>,
    pub circuit: Arc<CircuitBreaker>,
    pub actions: Arc<ActionHandler>,
    pub machine: Arc<StateMachine>,
    pub runner: JobRunner,
    pub devices: Arc<DeviceManager>,
}

impl Harness {
    pub async fn new(failure_threshold: u32, policy: BackoffPolicy) -> Self {
        let db = RelayDatabase::open_in_memory().await.unwrap();
        let clock = Arc::new(ManualClock::new(NOW));
        let metrics = Arc::new(Metrics::new());
        let store = JobStore::new(
            Arc::new(SqliteJobBackend::new(db.clone())),
            StoreSettings::default(),
            clock.clone(),
            metrics.clone(),
        );
        let driver = Arc::new(DryRunDriver::new());
        let overlay = Arc::new(MemoryOverlay::new());
        let circuit = Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold,
            ..CircuitBreakerConfig::default()
        }));
        let actions = Arc::new(ActionHandler::new(
            driver.clone(),
            circuit.clone(),
            metrics.clone(),
            &[RouterConfig::new(ROUTER, "10.10.0.1")],
        ));
        let machine = Arc::new(StateMachine::new(
            store.clone(),
            actions.clone(),
            clock.clone(),
            metrics.clone(),
            MachineSettings {
                default_trial_minutes: 5,
                retry_delay_ms: 30_000,
                offline_max_age_secs: 300,
            },
        ));
        let runner = JobRunner::new(
            store.clone(),
            machine.clone(),
            actions.clone(),
            clock.clone(),
            metrics.clone(),
            policy,
        );
        let devices = Arc::new(DeviceManager::new(
            db.clone(),
            overlay.clone(),
            actions.clone(),
            clock.clone(),
            metrics.clone(),
            180,
        ));
        Self {
            db,
            clock,
            metrics,
            store,
            driver,
            overlay,
            circuit,
            actions,
            machine,
            runner,
            devices,
        }
    }

    pub async fn with_defaults() -> Self {
        Self::new(5, BackoffPolicy::default()).await
    }

    pub fn reconciler(&self, remove_extra: bool) -> Reconciler {
        Reconciler::new(
            self.db.clone(),
            self.overlay.clone(),
            self.clock.clone(),
            self.metrics.clone(),
            ReconcilerSettings {
                remove_extra,
                handshake_online_secs: 180,
            },
        )
    }

    pub fn app_state(&self, api_secret: Option<&str>, rate_limit: u32) -> AppState {
        AppState {
            actions: self.actions.clone(),
            machine: self.machine.clone(),
            devices: self.devices.clone(),
            store: self.store.clone(),
            metrics: self.metrics.clone(),
            clock: self.clock.clone(),
            auth: Arc::new(ApiAuth {
                token: Some(TOKEN.to_string()),
                api_secret: api_secret.map(str::to_string),
            }),
            limiter: Arc::new(RateLimiter::new(rate_limit, self.clock.clone())),
        }
    }

    pub async fn jobs(&self) -> Vec<Job> {
        self.store.get_due_jobs(i64::MAX).await
    }
}

pub fn client_payload() -> Value {
    json!({
        "pedidoId": "order-42",
        "routerId": ROUTER,
        "ip": "10.0.0.5",
        "mac": "aa:bb:cc:dd:ee:ff",
    })
}

pub fn event(event_id: &str, event_type: EventType) -> Event {
    Event::new(event_id, event_type, client_payload())
}
