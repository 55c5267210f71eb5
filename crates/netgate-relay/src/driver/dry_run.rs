//! Driver that logs and records commands without touching hardware.

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use netgate_core::config::RouterConfig;
use tracing::info;

use super::{DriverError, DriverReport, RouterCommand, RouterDriver};

/// One recorded batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedBatch {
    pub router_id: String,
    pub commands: Vec<RouterCommand>,
}

/// Dry-run driver. Every batch succeeds unless its router was marked
/// unreachable with [`DryRunDriver::set_unreachable`].
#[derive(Debug, Default)]
pub struct DryRunDriver {
    batches: Mutex<Vec<RecordedBatch>>,
    unreachable: Mutex<HashSet<String>>,
}

impl DryRunDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a router outage (or its recovery).
    pub fn set_unreachable(&self, router_id: &str, unreachable: bool) {
        let mut set = self.unreachable.lock().unwrap_or_else(PoisonError::into_inner);
        if unreachable {
            set.insert(router_id.to_string());
        } else {
            set.remove(router_id);
        }
    }

    fn is_unreachable(&self, router_id: &str) -> bool {
        self.unreachable
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(router_id)
    }

    /// Every batch accepted so far, in order.
    pub fn batches(&self) -> Vec<RecordedBatch> {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Flattened list of commands sent to `router_id`.
    pub fn commands_for(&self, router_id: &str) -> Vec<RouterCommand> {
        self.batches()
            .into_iter()
            .filter(|b| b.router_id == router_id)
            .flat_map(|b| b.commands)
            .collect()
    }
}

#[async_trait]
impl RouterDriver for DryRunDriver {
    async fn execute(&self, router: &RouterConfig, commands: &[RouterCommand]) -> DriverReport {
        if self.is_unreachable(&router.id) {
            return DriverReport::failed(commands, "router unreachable (simulated)");
        }
        for cmd in commands {
            info!(router_id = %router.id, command = %cmd, "dry-run: router command");
        }
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedBatch {
                router_id: router.id.clone(),
                commands: commands.to_vec(),
            });
        DriverReport::success()
    }

    async fn identity(&self, router: &RouterConfig) -> Result<String, DriverError> {
        if self.is_unreachable(&router.id) {
            return Err(DriverError::Unreachable(router.id.clone()));
        }
        Ok(format!("dry-run-{}", router.id))
    }
}
