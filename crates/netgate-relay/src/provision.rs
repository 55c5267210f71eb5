//! Device provisioning: registry records plus their overlay peers.

use std::collections::HashMap;
use std::sync::Arc;

use netgate_core::db::DatabaseError;
use netgate_core::encoding::is_peer_key;
use netgate_core::{Clock, Metrics};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::actions::ActionHandler;
use crate::overlay::{
    ActualPeer, OverlayDriver, OverlayError, PeerHealth, PeerSpec, peer_status, validate_allowed,
};
use crate::storage::{DeviceParams, DeviceRecord, DeviceStatus, PeerBinding, RelayDatabase};

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("Invalid request: {0}")]
    Invalid(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Overlay error: {0}")]
    Overlay(#[from] OverlayError),

    #[error("Database error: {0}")]
    Database(DatabaseError),
}

impl From<DatabaseError> for ProvisionError {
    fn from(e: DatabaseError) -> Self {
        match e {
            DatabaseError::NotFound(what) => Self::NotFound(what),
            other => Self::Database(other),
        }
    }
}

/// Registration request for a device.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionRequest {
    #[serde(default)]
    pub device_id: Option<String>,
    pub public_key: String,
    /// Defaults to the device's tunnel address as a /32.
    #[serde(default)]
    pub allowed_addresses: Option<String>,
    #[serde(default)]
    pub router_address: Option<String>,
    #[serde(default)]
    pub credentials_ref: Option<String>,
    #[serde(default)]
    pub tunnel_address: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub keepalive: Option<u16>,
}

/// Provisioned device plus the router identity check result.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionResult {
    pub device: DeviceRecord,
    pub router_identity: Option<String>,
}

/// Health view of a single device.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceHealth {
    pub device: DeviceRecord,
    pub peer_present: bool,
    pub peer: Option<PeerHealth>,
    pub router_identity: Option<String>,
    pub router_error: Option<String>,
}

/// A live overlay peer joined with its binding.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerView {
    #[serde(flatten)]
    pub peer: ActualPeer,
    #[serde(flatten)]
    pub health: PeerHealth,
    pub binding: Option<PeerBinding>,
}

/// Deterministic tunnel address in `10.200.0.0/16` for a device id.
pub fn tunnel_address(device_id: &str) -> String {
    let digest = Sha256::digest(device_id.as_bytes());
    format!(
        "10.200.{}.{}",
        u16::from(digest[0]) % 254 + 1,
        u16::from(digest[1]) % 254 + 1
    )
}

fn check_device_id(id: &str) -> Result<(), ProvisionError> {
    let valid = !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(ProvisionError::Invalid(format!("invalid deviceId: {id}")))
    }
}

pub struct DeviceManager {
    db: RelayDatabase,
    overlay: Arc<dyn OverlayDriver>,
    actions: Arc<ActionHandler>,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
    online_secs: u64,
}

impl DeviceManager {
    pub fn new(
        db: RelayDatabase,
        overlay: Arc<dyn OverlayDriver>,
        actions: Arc<ActionHandler>,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
        online_secs: u64,
    ) -> Self {
        Self {
            db,
            overlay,
            actions,
            clock,
            metrics,
            online_secs,
        }
    }

    pub const fn db(&self) -> &RelayDatabase {
        &self.db
    }

    /// Register (or re-register) a device and ensure its overlay peer.
    pub async fn provision(
        &self,
        request: &ProvisionRequest,
    ) -> Result<ProvisionResult, ProvisionError> {
        let public_key = request.public_key.trim();
        if !is_peer_key(public_key) {
            return Err(ProvisionError::Invalid("invalid publicKey".to_string()));
        }
        let device_id = match request.device_id.as_deref().map(str::trim) {
            Some(id) => {
                check_device_id(id)?;
                id.to_string()
            }
            None => match self.db.find_device_by_key(public_key).await? {
                Some(existing) => existing.device_id,
                None => format!("dev-{}", uuid::Uuid::new_v4().simple()),
            },
        };
        let tunnel = request
            .tunnel_address
            .clone()
            .unwrap_or_else(|| tunnel_address(&device_id));
        let allowed = validate_allowed(
            request
                .allowed_addresses
                .as_deref()
                .unwrap_or(&format!("{tunnel}/32")),
        )
        .map_err(|e| ProvisionError::Invalid(e.to_string()))?;

        let now = self.clock.now_ms();
        self.db
            .upsert_device(
                &DeviceParams {
                    device_id: &device_id,
                    public_key,
                    allowed_addresses: &allowed,
                    router_address: request.router_address.as_deref(),
                    credentials_ref: request.credentials_ref.as_deref(),
                    tunnel_address: Some(&tunnel),
                },
                now,
            )
            .await?;

        self.overlay
            .add_or_update_peer(&PeerSpec {
                device_id: device_id.clone(),
                public_key: public_key.to_string(),
                allowed_addresses: allowed,
                endpoint: request.endpoint.clone(),
                keepalive: request.keepalive,
            })
            .await?;

        let router_identity = match request.credentials_ref.as_deref() {
            Some(router_id) => self.fetch_router_identity(router_id).await.ok(),
            None => None,
        };

        self.db
            .set_device_status(&device_id, DeviceStatus::Provisioned, now)
            .await?;
        if let Some(router_address) = request.router_address.as_deref() {
            self.db
                .upsert_binding(public_key, &device_id, router_address, now)
                .await?;
        }

        self.metrics.inc("devices.provisioned");
        info!(device_id = %device_id, tunnel = %tunnel, "Device provisioned");
        Ok(ProvisionResult {
            device: self.db.get_device(&device_id).await?,
            router_identity,
        })
    }

    /// Remove the overlay peer and mark the record deprovisioned.
    pub async fn deprovision(&self, device_id: &str) -> Result<DeviceRecord, ProvisionError> {
        let device = self.db.get_device(device_id).await?;
        self.overlay
            .remove_peer(&device.device_id, &device.public_key)
            .await?;
        let now = self.clock.now_ms();
        self.db
            .set_device_status(device_id, DeviceStatus::Deprovisioned, now)
            .await?;
        let dropped = self.db.remove_bindings_for_device(device_id).await?;
        self.metrics.inc("devices.deprovisioned");
        info!(device_id, bindings_dropped = dropped, "Device deprovisioned");
        Ok(self.db.get_device(device_id).await?)
    }

    /// Re-apply the overlay peer from the registry record.
    pub async fn sync(&self, device_id: &str) -> Result<DeviceRecord, ProvisionError> {
        let device = self.db.get_device(device_id).await?;
        if device.status() == DeviceStatus::Deprovisioned {
            return Err(ProvisionError::Invalid(format!(
                "device {device_id} is deprovisioned"
            )));
        }
        self.overlay
            .add_or_update_peer(&PeerSpec {
                device_id: device.device_id.clone(),
                public_key: device.public_key.clone(),
                allowed_addresses: device.allowed_addresses.clone(),
                endpoint: None,
                keepalive: None,
            })
            .await?;
        self.db
            .set_device_status(device_id, DeviceStatus::Synced, self.clock.now_ms())
            .await?;
        info!(device_id, "Device synced");
        Ok(self.db.get_device(device_id).await?)
    }

    /// Registry record joined with live overlay and router state.
    pub async fn health(&self, device_id: &str) -> Result<DeviceHealth, ProvisionError> {
        let device = self.db.get_device(device_id).await?;
        let peer = match self.overlay.list_peers().await {
            Ok(peers) => peers.into_iter().find(|p| p.public_key == device.public_key),
            Err(e) => {
                warn!(device_id, error = %e, "Overlay listing failed during health check");
                None
            }
        };
        let (router_identity, router_error) = match device.credentials_ref.as_deref() {
            Some(router_id) => match self.fetch_router_identity(router_id).await {
                Ok(name) => (Some(name), None),
                Err(e) => (None, Some(e)),
            },
            None => (None, None),
        };
        Ok(DeviceHealth {
            peer_present: peer.is_some(),
            peer: peer.map(|p| {
                peer_status(p.last_handshake_epoch, self.clock.now_secs(), self.online_secs)
            }),
            device,
            router_identity,
            router_error,
        })
    }

    /// Live overlay peers with status and binding.
    pub async fn peers(&self) -> Result<Vec<PeerView>, ProvisionError> {
        let bindings: HashMap<String, PeerBinding> = self
            .db
            .list_bindings()
            .await?
            .into_iter()
            .map(|b| (b.peer_key.clone(), b))
            .collect();
        let now = self.clock.now_secs();
        Ok(self
            .overlay
            .list_peers()
            .await?
            .into_iter()
            .map(|peer| PeerView {
                health: peer_status(peer.last_handshake_epoch, now, self.online_secs),
                binding: bindings.get(&peer.public_key).cloned(),
                peer,
            })
            .collect())
    }

    async fn fetch_router_identity(&self, router_id: &str) -> Result<String, String> {
        let Some(router) = self.actions.router(router_id) else {
            return Err(format!("unknown router: {router_id}"));
        };
        match self.actions.driver().identity(router).await {
            Ok(name) => Ok(name),
            Err(e) => {
                warn!(router_id, error = %e, "Router identity check failed");
                Err(e.to_string())
            }
        }
    }
}
