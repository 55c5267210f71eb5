//! `WireGuard` overlay driven through the `wg` command line tool.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use netgate_core::config::OverlayConfig;
use netgate_core::encoding::is_peer_key;
use tokio::process::Command;
use tracing::{debug, info};

use super::{ActualPeer, OverlayDriver, OverlayError, PeerSpec, validate_allowed};

/// Overlay backed by a local `WireGuard` interface.
#[derive(Debug, Clone)]
pub struct WireGuardOverlay {
    wg_binary: String,
    interface: String,
    timeout: Duration,
}

impl WireGuardOverlay {
    pub fn new(config: &OverlayConfig) -> Self {
        Self {
            wg_binary: config.wg_binary.clone(),
            interface: config.interface.clone(),
            timeout: Duration::from_millis(config.command_timeout_ms.max(1)),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String, OverlayError> {
        debug!(binary = %self.wg_binary, ?args, "Running overlay command");
        let child = Command::new(&self.wg_binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| {
                OverlayError::Timeout(u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX))
            })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(OverlayError::Command(format!(
                "{} {} exited with {}: {}",
                self.wg_binary,
                args.first().copied().unwrap_or_default(),
                output.status,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl OverlayDriver for WireGuardOverlay {
    async fn add_or_update_peer(&self, spec: &PeerSpec) -> Result<(), OverlayError> {
        if !is_peer_key(&spec.public_key) {
            return Err(OverlayError::InvalidKey);
        }
        let allowed = validate_allowed(&spec.allowed_addresses)?;
        let keepalive = spec.keepalive.map(|k| k.to_string());

        let mut args = vec![
            "set",
            self.interface.as_str(),
            "peer",
            spec.public_key.as_str(),
            "allowed-ips",
            allowed.as_str(),
        ];
        if let Some(endpoint) = spec.endpoint.as_deref() {
            args.extend(["endpoint", endpoint]);
        }
        if let Some(keepalive) = keepalive.as_deref() {
            args.extend(["persistent-keepalive", keepalive]);
        }
        self.run(&args).await?;
        info!(device_id = %spec.device_id, allowed = %allowed, "Overlay peer set");
        Ok(())
    }

    async fn remove_peer(&self, device_id: &str, public_key: &str) -> Result<(), OverlayError> {
        if !is_peer_key(public_key) {
            return Err(OverlayError::InvalidKey);
        }
        self.run(&["set", &self.interface, "peer", public_key, "remove"])
            .await?;
        info!(device_id, "Overlay peer removed");
        Ok(())
    }

    async fn list_peers(&self) -> Result<Vec<ActualPeer>, OverlayError> {
        let out = self.run(&["show", &self.interface, "dump"]).await?;
        Ok(parse_dump(&out))
    }
}

/// Parse `wg show <iface> dump` output.
///
/// The first line describes the interface (4 columns) and is skipped; each
/// peer line has 8 tab-separated columns.
pub fn parse_dump(output: &str) -> Vec<ActualPeer> {
    output
        .lines()
        .filter_map(|line| {
            let cols: Vec<&str> = line.split('\t').collect();
            if cols.len() != 8 {
                return None;
            }
            let none_to_empty = |s: &str| if s == "(none)" { String::new() } else { s.to_string() };
            Some(ActualPeer {
                public_key: cols[0].to_string(),
                allowed_addresses: super::normalize_allowed(&none_to_empty(cols[3])),
                endpoint: Some(none_to_empty(cols[2])).filter(|e| !e.is_empty()),
                last_handshake_epoch: cols[4].parse().unwrap_or(0),
                rx_bytes: cols[5].parse().unwrap_or(0),
                tx_bytes: cols[6].parse().unwrap_or(0),
            })
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    const DUMP: &str = "cHJpdmF0ZQ==\tc2VydmVy\t51820\toff\n\
        xTIBA5rboUvnH4htodjb6e697QjLERt1NAB4mZqp8Dg=\t(none)\t203.0.113.7:40312\t10.200.4.9/32\t1700000000\t1024\t2048\t25\n\
        TrMvSoP4jYQlY6RIzBgbssQqY3vxI2Pi+y71lOWWXX0=\t(none)\t(none)\t(none)\t0\t0\t0\toff\n";

    #[test]
    fn dump_skips_interface_line() {
        let peers = parse_dump(DUMP);
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].allowed_addresses, "10.200.4.9/32");
        assert_eq!(peers[0].endpoint.as_deref(), Some("203.0.113.7:40312"));
        assert_eq!(peers[0].last_handshake_epoch, 1_700_000_000);
        assert_eq!(peers[0].tx_bytes, 2048);
    }

    #[test]
    fn dump_maps_none_columns() {
        let peers = parse_dump(DUMP);
        assert_eq!(peers[1].allowed_addresses, "");
        assert_eq!(peers[1].endpoint, None);
        assert_eq!(peers[1].last_handshake_epoch, 0);
    }

    #[tokio::test]
    async fn rejects_bad_key_before_spawning() {
        let overlay = WireGuardOverlay::new(&OverlayConfig {
            wg_binary: "/nonexistent/wg".to_string(),
            ..OverlayConfig::default()
        });
        let spec = PeerSpec {
            device_id: "d1".to_string(),
            public_key: "short".to_string(),
            allowed_addresses: "10.200.1.1/32".to_string(),
            endpoint: None,
            keepalive: None,
        };
        assert!(matches!(
            overlay.add_or_update_peer(&spec).await,
            Err(OverlayError::InvalidKey)
        ));
    }

    #[tokio::test]
    async fn missing_binary_is_an_error() {
        let overlay = WireGuardOverlay::new(&OverlayConfig {
            wg_binary: "/nonexistent/wg".to_string(),
            ..OverlayConfig::default()
        });
        assert!(overlay.list_peers().await.is_err());
    }
}
