#![allow(clippy::unwrap_used)]

mod common;

use common::{Harness, NOW};
use netgate_relay::overlay::ActualPeer;
use netgate_relay::storage::{DeviceParams, DeviceStatus};

const KEY_A: &str = "0Iyn/4D61zi+ScgOjnCJqECH4Vz1kHS1JR41bDbs1mo=";
const KEY_B: &str = "gLkqnLtPnTeLi51p9WUDHHIJzM60V+uiKeB4JNHHgqc=";
const KEY_STRAY: &str = "6wDaU1+wp8WJ18eGB3PNUE52LNU+GOFfJFbECVvBWZw=";

async fn register(h: &Harness, id: &str, key: &str, allowed: &str, router: Option<&str>) {
    h.db.upsert_device(
        &DeviceParams {
            device_id: id,
            public_key: key,
            allowed_addresses: allowed,
            router_address: router,
            credentials_ref: Some("R1"),
            tunnel_address: None,
        },
        NOW,
    )
    .await
    .unwrap();
}

fn stray_peer() -> ActualPeer {
    ActualPeer {
        public_key: KEY_STRAY.to_string(),
        allowed_addresses: "10.200.9.9/32".to_string(),
        endpoint: None,
        last_handshake_epoch: NOW / 1000,
        rx_bytes: 0,
        tx_bytes: 0,
    }
}

#[tokio::test]
async fn converges_missing_peers_and_bindings() {
    let h = Harness::with_defaults().await;
    register(&h, "mik-a", KEY_A, "10.200.0.2/32, 10.200.0.2/32", Some("10.10.0.1")).await;
    register(&h, "mik-b", KEY_B, "10.200.0.3/32", None).await;
    h.db.set_device_status("mik-b", DeviceStatus::Deprovisioned, NOW)
        .await
        .unwrap();

    let reconciler = h.reconciler(false);
    let report = reconciler.reconcile_once().await.unwrap();
    assert_eq!(report.desired, 1);
    assert_eq!(report.added, 1);
    assert_eq!(report.bindings_created, 1);
    assert_eq!(report.errors, 0);

    let peer = h.overlay.peer(KEY_A).unwrap();
    assert_eq!(peer.allowed_addresses, "10.200.0.2/32");
    assert!(h.overlay.peer(KEY_B).is_none());

    let binding = h.db.get_binding(KEY_A).await.unwrap().unwrap();
    assert_eq!(binding.device_id, "mik-a");
    assert_eq!(binding.router_address, "10.10.0.1");

    // Second pass has nothing to change; the peer has never handshaken.
    let report = reconciler.reconcile_once().await.unwrap();
    assert_eq!(report.actual, 1);
    assert_eq!(report.added + report.updated + report.bindings_created, 0);
    assert_eq!(report.missing_bindings, 0);
    assert_eq!(report.stale, 1);
}

#[tokio::test]
async fn repairs_drifted_allowed_addresses() {
    let h = Harness::with_defaults().await;
    register(&h, "mik-a", KEY_A, "10.200.0.2/32", None).await;
    h.overlay.insert(ActualPeer {
        public_key: KEY_A.to_string(),
        allowed_addresses: "10.200.0.99/32".to_string(),
        endpoint: None,
        last_handshake_epoch: NOW / 1000 - 10,
        rx_bytes: 0,
        tx_bytes: 0,
    });

    let report = h.reconciler(false).reconcile_once().await.unwrap();
    assert_eq!(report.updated, 1);
    assert_eq!(report.added, 0);
    assert_eq!(report.stale, 0);
    assert_eq!(h.overlay.peer(KEY_A).unwrap().allowed_addresses, "10.200.0.2/32");

    // Without a router address the binding falls back to the credentials ref.
    let binding = h.db.get_binding(KEY_A).await.unwrap().unwrap();
    assert_eq!(binding.router_address, "R1");
}

#[tokio::test]
async fn extra_peers_are_only_reported_by_default() {
    let h = Harness::with_defaults().await;
    h.overlay.insert(stray_peer());

    let report = h.reconciler(false).reconcile_once().await.unwrap();
    assert_eq!(report.extra, 1);
    assert_eq!(report.removed, 0);
    assert!(h.overlay.peer(KEY_STRAY).is_some());
    assert_eq!(h.metrics.get("reconciler.extra"), 1);
}

#[tokio::test]
async fn extra_peers_are_removed_when_enabled() {
    let h = Harness::with_defaults().await;
    h.overlay.insert(stray_peer());

    let report = h.reconciler(true).reconcile_once().await.unwrap();
    assert_eq!(report.extra, 1);
    assert_eq!(report.removed, 1);
    assert!(h.overlay.peer(KEY_STRAY).is_none());
}

#[tokio::test]
async fn overlay_failure_aborts_the_pass() {
    let h = Harness::with_defaults().await;
    register(&h, "mik-a", KEY_A, "10.200.0.2/32", None).await;
    h.overlay.set_failing(true);

    assert!(h.reconciler(false).reconcile_once().await.is_err());
    assert_eq!(h.metrics.get("reconciler.errors"), 1);
    assert!(h.db.get_binding(KEY_A).await.unwrap().is_none());
}
