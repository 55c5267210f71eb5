//! Desired-versus-actual overlay peer reconciliation.
//!
//! Desired state is every registry device that wants a peer; actual state
//! is whatever the overlay reports. One pass adds or repairs missing peers,
//! fills in missing bindings, and reports anomalies. Peers without a
//! registry entry are only removed when `remove_extra` is set.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use netgate_core::config::ReconcilerConfig;
use netgate_core::db::DatabaseError;
use netgate_core::{Clock, Metrics};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::overlay::{
    OverlayDriver, OverlayError, PeerSpec, PeerStatus, normalize_allowed, peer_status,
};
use crate::storage::{DeviceRecord, RelayDatabase};

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("Registry error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Overlay error: {0}")]
    Overlay(#[from] OverlayError),
}

/// What one pass saw and did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub desired: usize,
    pub actual: usize,
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub extra: usize,
    pub missing_bindings: usize,
    pub bindings_created: usize,
    pub stale: usize,
    pub errors: usize,
}

#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    pub remove_extra: bool,
    pub handshake_online_secs: u64,
}

impl From<&ReconcilerConfig> for ReconcilerSettings {
    fn from(config: &ReconcilerConfig) -> Self {
        Self {
            remove_extra: config.remove_extra,
            handshake_online_secs: config.handshake_online_secs,
        }
    }
}

pub struct Reconciler {
    db: RelayDatabase,
    overlay: Arc<dyn OverlayDriver>,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
    settings: ReconcilerSettings,
}

impl Reconciler {
    pub fn new(
        db: RelayDatabase,
        overlay: Arc<dyn OverlayDriver>,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            db,
            overlay,
            clock,
            metrics,
            settings,
        }
    }

    /// Run a single reconciliation pass.
    pub async fn reconcile_once(&self) -> Result<ReconcileReport, ReconcileError> {
        let desired: HashMap<String, DeviceRecord> = self
            .db
            .list_devices()
            .await
            .inspect_err(|_| self.metrics.inc("reconciler.errors"))?
            .into_iter()
            .filter(DeviceRecord::wants_peer)
            .map(|d| (d.public_key.clone(), d))
            .collect();
        let actual = self
            .overlay
            .list_peers()
            .await
            .inspect_err(|_| self.metrics.inc("reconciler.errors"))?;
        let mut bound: HashSet<String> = self
            .db
            .list_bindings()
            .await
            .inspect_err(|_| self.metrics.inc("reconciler.errors"))?
            .into_iter()
            .map(|b| b.peer_key)
            .collect();

        let mut report = ReconcileReport {
            desired: desired.len(),
            actual: actual.len(),
            ..ReconcileReport::default()
        };
        let actual_allowed: HashMap<&str, String> = actual
            .iter()
            .map(|p| (p.public_key.as_str(), normalize_allowed(&p.allowed_addresses)))
            .collect();

        for (key, device) in &desired {
            let want = normalize_allowed(&device.allowed_addresses);
            match actual_allowed.get(key.as_str()) {
                None => self.converge(device, &want, true, &mut report).await,
                Some(have) if *have != want => {
                    self.converge(device, &want, false, &mut report).await;
                }
                Some(_) => {}
            }

            if !bound.contains(key) && self.bind(device, &mut report).await {
                bound.insert(key.clone());
            }
        }

        let now_secs = self.clock.now_secs();
        for peer in &actual {
            let key = peer.public_key.as_str();
            if !desired.contains_key(key) {
                self.handle_extra(key, &mut report).await;
                continue;
            }
            if !bound.contains(key) {
                report.missing_bindings += 1;
                self.metrics.inc("reconciler.missing_binding");
                warn!(peer_key = key, "Overlay peer has no binding");
            }
            let health = peer_status(
                peer.last_handshake_epoch,
                now_secs,
                self.settings.handshake_online_secs,
            );
            if health.status != PeerStatus::Online {
                report.stale += 1;
                self.metrics.inc("reconciler.stale");
                warn!(
                    peer_key = key,
                    status = ?health.status,
                    handshake_age_secs = ?health.handshake_age_secs,
                    "Stale overlay peer"
                );
            }
        }

        if report.added + report.updated + report.removed + report.extra + report.errors > 0 {
            info!(?report, "Reconciliation pass");
        } else {
            debug!(?report, "Reconciliation pass, no drift");
        }
        Ok(report)
    }

    async fn converge(
        &self,
        device: &DeviceRecord,
        allowed: &str,
        is_new: bool,
        report: &mut ReconcileReport,
    ) {
        let spec = PeerSpec {
            device_id: device.device_id.clone(),
            public_key: device.public_key.clone(),
            allowed_addresses: allowed.to_string(),
            endpoint: None,
            keepalive: None,
        };
        match self.overlay.add_or_update_peer(&spec).await {
            Ok(()) => {
                if is_new {
                    report.added += 1;
                    self.metrics.inc("reconciler.added");
                } else {
                    report.updated += 1;
                    self.metrics.inc("reconciler.updated");
                }
                info!(device_id = %device.device_id, is_new, "Overlay peer converged");
            }
            Err(e) => {
                report.errors += 1;
                self.metrics.inc("reconciler.errors");
                warn!(device_id = %device.device_id, error = %e, "Could not converge overlay peer");
            }
        }
    }

    async fn bind(&self, device: &DeviceRecord, report: &mut ReconcileReport) -> bool {
        let router = device
            .router_address
            .as_deref()
            .or(device.credentials_ref.as_deref())
            .unwrap_or_default();
        match self
            .db
            .upsert_binding(
                &device.public_key,
                &device.device_id,
                router,
                self.clock.now_ms(),
            )
            .await
        {
            Ok(_) => {
                report.bindings_created += 1;
                self.metrics.inc("reconciler.binding_created");
                info!(device_id = %device.device_id, "Created missing peer binding");
                true
            }
            Err(e) => {
                report.errors += 1;
                self.metrics.inc("reconciler.errors");
                warn!(device_id = %device.device_id, error = %e, "Could not create peer binding");
                false
            }
        }
    }

    async fn handle_extra(&self, key: &str, report: &mut ReconcileReport) {
        report.extra += 1;
        self.metrics.inc("reconciler.extra");
        let device_id = match self.db.get_binding(key).await {
            Ok(Some(binding)) => binding.device_id,
            _ => "unknown".to_string(),
        };
        if !self.settings.remove_extra {
            warn!(peer_key = key, device_id = %device_id, "Extra overlay peer detected");
            return;
        }
        match self.overlay.remove_peer(&device_id, key).await {
            Ok(()) => {
                report.removed += 1;
                self.metrics.inc("reconciler.removed");
                if let Err(e) = self.db.remove_binding(key).await {
                    warn!(peer_key = key, error = %e, "Could not drop binding of removed peer");
                }
                info!(peer_key = key, device_id = %device_id, "Extra overlay peer removed");
            }
            Err(e) => {
                report.errors += 1;
                self.metrics.inc("reconciler.errors");
                warn!(peer_key = key, error = %e, "Could not remove extra overlay peer");
            }
        }
    }
}

/// Spawn the reconciliation loop, running every `interval` until
/// `shutdown` fires.
pub fn spawn_reconciler_task(
    reconciler: Arc<Reconciler>,
    interval: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = timer.tick() => {
                    if let Err(e) = reconciler.reconcile_once().await {
                        warn!(error = %e, "Reconciliation pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("Reconciler shutting down");
                    return;
                }
            }
        }
    })
}
