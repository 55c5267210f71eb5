//! Data models for relay storage.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle of a registered device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Registered,
    Provisioned,
    Synced,
    Deprovisioned,
}

impl DeviceStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Registered => "registered",
            Self::Provisioned => "provisioned",
            Self::Synced => "synced",
            Self::Deprovisioned => "deprovisioned",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "registered" => Ok(Self::Registered),
            "provisioned" => Ok(Self::Provisioned),
            "synced" => Ok(Self::Synced),
            "deprovisioned" => Ok(Self::Deprovisioned),
            other => Err(format!("unknown device status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub device_id: String,
    pub public_key: String,
    /// Normalized, comma-separated list of CIDRs.
    pub allowed_addresses: String,
    pub router_address: Option<String>,
    /// Id of the configured router whose credentials apply to this device.
    pub credentials_ref: Option<String>,
    pub tunnel_address: Option<String>,
    pub status: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl DeviceRecord {
    /// Parsed status; unknown values read as `Registered`.
    pub fn status(&self) -> DeviceStatus {
        self.status.parse().unwrap_or(DeviceStatus::Registered)
    }

    /// Whether the device belongs in the desired overlay peer set.
    pub fn wants_peer(&self) -> bool {
        self.status() != DeviceStatus::Deprovisioned
            && !self.public_key.trim().is_empty()
            && !self.allowed_addresses.trim().is_empty()
    }
}

/// Maps a live overlay peer back to its device and router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct PeerBinding {
    pub peer_key: String,
    pub device_id: String,
    pub router_address: String,
    pub created_at: i64,
}

/// Raw `jobs` row; the job store converts it into a typed `Job`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobRow {
    pub id: String,
    pub kind: String,
    pub origin_event_id: Option<String>,
    pub run_at: i64,
    pub payload: String,
    pub attempts: i64,
    pub created_at: i64,
}
