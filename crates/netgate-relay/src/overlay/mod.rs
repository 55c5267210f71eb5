//! Overlay network (VPN) peer management.
//!
//! The relay treats the overlay as the source of *actual* peer state and
//! the registry as *desired* state. [`OverlayDriver`] is the narrow
//! interface between them.

mod memory;
mod wireguard;

use std::net::IpAddr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use memory::MemoryOverlay;
pub use wireguard::{WireGuardOverlay, parse_dump};

/// Overlay driver errors.
#[derive(Debug, thiserror::Error)]
pub enum OverlayError {
    #[error("Invalid peer public key")]
    InvalidKey,

    #[error("Invalid allowed address: {0}")]
    InvalidAddress(String),

    #[error("Overlay command failed: {0}")]
    Command(String),

    #[error("Overlay command timed out after {0} ms")]
    Timeout(u64),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Desired configuration of one peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSpec {
    pub device_id: String,
    pub public_key: String,
    /// Comma separated list of addresses or CIDR ranges.
    pub allowed_addresses: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub keepalive: Option<u16>,
}

/// Peer as currently configured in the overlay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActualPeer {
    pub public_key: String,
    pub allowed_addresses: String,
    pub endpoint: Option<String>,
    /// Epoch seconds of the last handshake, 0 when none happened.
    pub last_handshake_epoch: i64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Overlay peer operations. Adds and updates are idempotent.
#[async_trait]
pub trait OverlayDriver: Send + Sync {
    async fn add_or_update_peer(&self, spec: &PeerSpec) -> Result<(), OverlayError>;

    async fn remove_peer(&self, device_id: &str, public_key: &str) -> Result<(), OverlayError>;

    async fn list_peers(&self) -> Result<Vec<ActualPeer>, OverlayError>;
}

/// Connectivity classification derived from the last handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PeerStatus {
    Online,
    Offline,
    NeverConnected,
}

/// Status plus handshake age in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerHealth {
    pub status: PeerStatus,
    pub handshake_age_secs: Option<i64>,
}

/// Classify a peer: online when its last handshake is at most
/// `online_secs` old.
pub fn peer_status(handshake_epoch: i64, now_secs: i64, online_secs: u64) -> PeerHealth {
    if handshake_epoch <= 0 {
        return PeerHealth {
            status: PeerStatus::NeverConnected,
            handshake_age_secs: None,
        };
    }
    let age = now_secs.saturating_sub(handshake_epoch).max(0);
    let online = u64::try_from(age).is_ok_and(|age| age <= online_secs);
    PeerHealth {
        status: if online {
            PeerStatus::Online
        } else {
            PeerStatus::Offline
        },
        handshake_age_secs: Some(age),
    }
}

/// Canonical form of an allowed-address list: trimmed, sorted, deduplicated.
pub fn normalize_allowed(list: &str) -> String {
    let mut parts: Vec<&str> = list
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    parts.sort_unstable();
    parts.dedup();
    parts.join(",")
}

/// Validate and normalize an allowed-address list.
pub fn validate_allowed(list: &str) -> Result<String, OverlayError> {
    let normalized = normalize_allowed(list);
    if normalized.is_empty() {
        return Err(OverlayError::InvalidAddress(list.to_string()));
    }
    for entry in normalized.split(',') {
        let (addr, prefix) = entry.split_once('/').unwrap_or((entry, ""));
        let ip: IpAddr = addr
            .parse()
            .map_err(|_| OverlayError::InvalidAddress(entry.to_string()))?;
        if !prefix.is_empty() {
            let max = if ip.is_ipv4() { 32 } else { 128 };
            match prefix.parse::<u8>() {
                Ok(p) if p <= max => {}
                _ => return Err(OverlayError::InvalidAddress(entry.to_string())),
            }
        }
    }
    Ok(normalized)
}
