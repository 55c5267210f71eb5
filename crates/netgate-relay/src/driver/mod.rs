//! Router command drivers.
//!
//! The relay speaks to routers in terms of [`RouterCommand`]s, each an
//! "ensure state" operation that is safe to apply repeatedly. A
//! [`RouterDriver`] executes a batch against one router and reports the
//! commands that failed.

mod dry_run;
mod rest;

use std::fmt;

use async_trait::async_trait;
use netgate_core::config::RouterConfig;
use serde::{Deserialize, Serialize};

pub use dry_run::DryRunDriver;
pub use rest::RestDriver;

/// Errors from reaching a router outside a command batch.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Router API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Router unreachable: {0}")]
    Unreachable(String),
}

/// Idempotent domain command for a router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RouterCommand {
    /// Ensure `address` is on firewall address list `list`.
    EnsureAddressList {
        list: String,
        address: String,
        comment: String,
    },
    /// Remove `address` from `list` if present.
    RemoveAddressList { list: String, address: String },
    /// Ensure a bypass binding from `mac` to `address`.
    EnsureBypassBinding { mac: String, address: String },
    /// Remove any binding for `mac`.
    RemoveBinding { mac: String },
    /// Drop hotspot host entries for `mac`.
    RemoveHost { mac: String },
    /// Drop active hotspot sessions by `mac` and/or `address`.
    RemoveActive {
        mac: Option<String>,
        address: Option<String>,
    },
}

impl fmt::Display for RouterCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EnsureAddressList {
                list,
                address,
                comment,
            } => write!(
                f,
                "/ip/firewall/address-list ensure list={list} address={address} comment={comment}"
            ),
            Self::RemoveAddressList { list, address } => {
                write!(f, "/ip/firewall/address-list remove list={list} address={address}")
            }
            Self::EnsureBypassBinding { mac, address } => write!(
                f,
                "/ip/hotspot/ip-binding ensure mac-address={mac} address={address} type=bypassed"
            ),
            Self::RemoveBinding { mac } => {
                write!(f, "/ip/hotspot/ip-binding remove mac-address={mac}")
            }
            Self::RemoveHost { mac } => write!(f, "/ip/hotspot/host remove mac-address={mac}"),
            Self::RemoveActive { mac, address } => {
                write!(f, "/ip/hotspot/active remove")?;
                if let Some(mac) = mac {
                    write!(f, " mac-address={mac}")?;
                }
                if let Some(address) = address {
                    write!(f, " address={address}")?;
                }
                Ok(())
            }
        }
    }
}

/// A command that failed within a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandError {
    pub cmd: String,
    pub message: String,
}

/// Result of executing a batch against one router.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverReport {
    pub ok: bool,
    pub errors: Vec<CommandError>,
}

impl DriverReport {
    pub const fn success() -> Self {
        Self {
            ok: true,
            errors: Vec::new(),
        }
    }

    pub fn from_errors(errors: Vec<CommandError>) -> Self {
        Self {
            ok: errors.is_empty(),
            errors,
        }
    }

    /// Report where every command in the batch failed for one reason.
    pub fn failed(commands: &[RouterCommand], message: &str) -> Self {
        Self::from_errors(
            commands
                .iter()
                .map(|cmd| CommandError {
                    cmd: cmd.to_string(),
                    message: message.to_string(),
                })
                .collect(),
        )
    }
}

/// Executes command batches against fleet routers.
#[async_trait]
pub trait RouterDriver: Send + Sync {
    /// Run `commands` in order. Later commands still run when an earlier one
    /// fails, so one bad entry cannot block the rest of a grant or revoke.
    async fn execute(&self, router: &RouterConfig, commands: &[RouterCommand]) -> DriverReport;

    /// Cheap reachability check returning the router's identity name.
    async fn identity(&self, router: &RouterConfig) -> Result<String, DriverError>;
}
