//! Router command sequences for each action.

use crate::driver::RouterCommand;

use super::types::{GrantTarget, RevokeTarget};

/// Address list holding clients with paid or trial access.
pub const PAID_LIST: &str = "paid_clients";

/// Grant: allowlist the ip, bypass the hotspot for the mac, then drop
/// any captive session so the client reconnects with access.
pub fn grant(target: &GrantTarget) -> Vec<RouterCommand> {
    vec![
        RouterCommand::EnsureAddressList {
            list: PAID_LIST.to_string(),
            address: target.ip.clone(),
            comment: format!("pedido:{}", target.order_id),
        },
        RouterCommand::EnsureBypassBinding {
            mac: target.mac.clone(),
            address: target.ip.clone(),
        },
        RouterCommand::RemoveHost {
            mac: target.mac.clone(),
        },
        RouterCommand::RemoveActive {
            mac: Some(target.mac.clone()),
            address: None,
        },
    ]
}

/// Revoke: every step is remove-if-present.
pub fn revoke(target: &RevokeTarget) -> Vec<RouterCommand> {
    let mut cmds = Vec::new();
    if let Some(ip) = &target.ip {
        cmds.push(RouterCommand::RemoveAddressList {
            list: PAID_LIST.to_string(),
            address: ip.clone(),
        });
    }
    if let Some(mac) = &target.mac {
        cmds.push(RouterCommand::RemoveBinding { mac: mac.clone() });
    }
    cmds.push(RouterCommand::RemoveActive {
        mac: target.mac.clone(),
        address: target.ip.clone(),
    });
    if let Some(mac) = &target.mac {
        cmds.push(RouterCommand::RemoveHost { mac: mac.clone() });
    }
    cmds
}

/// Resync: drop the existing binding and grant again.
pub fn resync(target: &GrantTarget) -> Vec<RouterCommand> {
    let mut cmds = vec![RouterCommand::RemoveBinding {
        mac: target.mac.clone(),
    }];
    cmds.extend(grant(target));
    cmds
}
