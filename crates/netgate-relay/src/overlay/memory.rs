//! In-memory overlay used for dry runs and tests.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tracing::info;

use super::{ActualPeer, OverlayDriver, OverlayError, PeerSpec};

/// Overlay that keeps its peer table in process memory.
#[derive(Debug, Default)]
pub struct MemoryOverlay {
    peers: Mutex<BTreeMap<String, ActualPeer>>,
    failing: Mutex<bool>,
}

impl MemoryOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a peer directly, bypassing validation.
    pub fn insert(&self, peer: ActualPeer) {
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(peer.public_key.clone(), peer);
    }

    /// Record a handshake for `public_key` at `epoch_secs`.
    pub fn set_handshake(&self, public_key: &str, epoch_secs: i64) {
        if let Some(peer) = self
            .peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(public_key)
        {
            peer.last_handshake_epoch = epoch_secs;
        }
    }

    /// Make every subsequent call fail.
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap_or_else(PoisonError::into_inner) = failing;
    }

    pub fn peer(&self, public_key: &str) -> Option<ActualPeer> {
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(public_key)
            .cloned()
    }

    fn check(&self) -> Result<(), OverlayError> {
        if *self.failing.lock().unwrap_or_else(PoisonError::into_inner) {
            return Err(OverlayError::Command("overlay unavailable (simulated)".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl OverlayDriver for MemoryOverlay {
    async fn add_or_update_peer(&self, spec: &PeerSpec) -> Result<(), OverlayError> {
        self.check()?;
        info!(device_id = %spec.device_id, allowed = %spec.allowed_addresses, "memory overlay: set peer");
        let mut peers = self.peers.lock().unwrap_or_else(PoisonError::into_inner);
        let peer = peers
            .entry(spec.public_key.clone())
            .or_insert_with(|| ActualPeer {
                public_key: spec.public_key.clone(),
                allowed_addresses: String::new(),
                endpoint: None,
                last_handshake_epoch: 0,
                rx_bytes: 0,
                tx_bytes: 0,
            });
        peer.allowed_addresses.clone_from(&spec.allowed_addresses);
        if spec.endpoint.is_some() {
            peer.endpoint.clone_from(&spec.endpoint);
        }
        Ok(())
    }

    async fn remove_peer(&self, device_id: &str, public_key: &str) -> Result<(), OverlayError> {
        self.check()?;
        info!(device_id, "memory overlay: remove peer");
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(public_key);
        Ok(())
    }

    async fn list_peers(&self) -> Result<Vec<ActualPeer>, OverlayError> {
        self.check()?;
        Ok(self
            .peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect())
    }
}
