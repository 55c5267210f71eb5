//! Device registry and peer binding queries.

use super::db::RelayDatabase;
use super::models::{DeviceRecord, DeviceStatus, PeerBinding};
use netgate_core::db::DatabaseError;

/// Parameters for registering or refreshing a device.
pub struct DeviceParams<'a> {
    pub device_id: &'a str,
    pub public_key: &'a str,
    pub allowed_addresses: &'a str,
    pub router_address: Option<&'a str>,
    pub credentials_ref: Option<&'a str>,
    pub tunnel_address: Option<&'a str>,
}

impl RelayDatabase {
    // =========================================================================
    // Device queries
    // =========================================================================

    /// Insert a device or refresh its key and addresses.
    ///
    /// Re-registering keeps `created_at` and the current status, and only
    /// overwrites metadata fields that are provided.
    pub async fn upsert_device(
        &self,
        params: &DeviceParams<'_>,
        now: i64,
    ) -> Result<DeviceRecord, DatabaseError> {
        sqlx::query(
            "INSERT INTO devices (device_id, public_key, allowed_addresses, router_address, credentials_ref, tunnel_address, status, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, 'registered', ?, ?)
             ON CONFLICT(device_id) DO UPDATE SET
                public_key = excluded.public_key,
                allowed_addresses = excluded.allowed_addresses,
                router_address = COALESCE(excluded.router_address, devices.router_address),
                credentials_ref = COALESCE(excluded.credentials_ref, devices.credentials_ref),
                tunnel_address = COALESCE(excluded.tunnel_address, devices.tunnel_address),
                updated_at = excluded.updated_at",
        )
        .bind(params.device_id)
        .bind(params.public_key)
        .bind(params.allowed_addresses)
        .bind(params.router_address)
        .bind(params.credentials_ref)
        .bind(params.tunnel_address)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_device(params.device_id).await
    }

    /// Get a device by id.
    pub async fn get_device(&self, device_id: &str) -> Result<DeviceRecord, DatabaseError> {
        sqlx::query_as::<_, DeviceRecord>("SELECT * FROM devices WHERE device_id = ?")
            .bind(device_id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("device {device_id}")))
    }

    /// Find the device currently holding a peer key.
    pub async fn find_device_by_key(
        &self,
        public_key: &str,
    ) -> Result<Option<DeviceRecord>, DatabaseError> {
        let device = sqlx::query_as::<_, DeviceRecord>(
            "SELECT * FROM devices WHERE public_key = ? ORDER BY updated_at DESC LIMIT 1",
        )
        .bind(public_key)
        .fetch_optional(self.pool())
        .await?;

        Ok(device)
    }

    /// List all devices, newest first.
    pub async fn list_devices(&self) -> Result<Vec<DeviceRecord>, DatabaseError> {
        let devices = sqlx::query_as::<_, DeviceRecord>(
            "SELECT * FROM devices ORDER BY created_at DESC, device_id ASC",
        )
        .fetch_all(self.pool())
        .await?;

        Ok(devices)
    }

    /// Update a device's status. Returns false when the device is unknown.
    pub async fn set_device_status(
        &self,
        device_id: &str,
        status: DeviceStatus,
        now: i64,
    ) -> Result<bool, DatabaseError> {
        let result =
            sqlx::query("UPDATE devices SET status = ?, updated_at = ? WHERE device_id = ?")
                .bind(status.as_str())
                .bind(now)
                .bind(device_id)
                .execute(self.pool())
                .await?;

        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Peer binding queries
    // =========================================================================

    /// Create or replace the binding for a peer key.
    pub async fn upsert_binding(
        &self,
        peer_key: &str,
        device_id: &str,
        router_address: &str,
        now: i64,
    ) -> Result<PeerBinding, DatabaseError> {
        sqlx::query(
            "INSERT INTO peer_bindings (peer_key, device_id, router_address, created_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(peer_key) DO UPDATE SET device_id = excluded.device_id, router_address = excluded.router_address",
        )
        .bind(peer_key)
        .bind(device_id)
        .bind(router_address)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_binding(peer_key)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("binding {peer_key}")))
    }

    pub async fn get_binding(&self, peer_key: &str) -> Result<Option<PeerBinding>, DatabaseError> {
        let binding =
            sqlx::query_as::<_, PeerBinding>("SELECT * FROM peer_bindings WHERE peer_key = ?")
                .bind(peer_key)
                .fetch_optional(self.pool())
                .await?;

        Ok(binding)
    }

    pub async fn list_bindings(&self) -> Result<Vec<PeerBinding>, DatabaseError> {
        let bindings = sqlx::query_as::<_, PeerBinding>(
            "SELECT * FROM peer_bindings ORDER BY created_at ASC, peer_key ASC",
        )
        .fetch_all(self.pool())
        .await?;

        Ok(bindings)
    }

    /// Remove a binding by peer key. Returns true if a row was deleted.
    pub async fn remove_binding(&self, peer_key: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM peer_bindings WHERE peer_key = ?")
            .bind(peer_key)
            .execute(self.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Remove every binding that points at a device.
    pub async fn remove_bindings_for_device(&self, device_id: &str) -> Result<u64, DatabaseError> {
        let result = sqlx::query("DELETE FROM peer_bindings WHERE device_id = ?")
            .bind(device_id)
            .execute(self.pool())
            .await?;

        Ok(result.rows_affected())
    }
}
