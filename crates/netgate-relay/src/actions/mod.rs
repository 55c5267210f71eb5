//! Allowlisted router actions.
//!
//! [`ActionHandler::execute`] is the single entry point for anything that
//! changes router state, whether it comes from the event state machine, a
//! job, or the operational API. Each call is validated, audited, timed and
//! reported to the circuit breaker.

pub mod commands;
mod types;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use netgate_core::Metrics;
use netgate_core::config::RouterConfig;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::audit;
use crate::circuit::CircuitBreaker;
use crate::driver::{RouterCommand, RouterDriver};

pub use types::{
    ActionErrorBody, ActionErrorCode, ActionKind, ActionRequest, ActionResponse, GrantTarget,
    RevokeTarget, ValidationError, normalize_ip, normalize_mac,
};
pub(crate) use types::router_field;

/// Failure of a single action.
#[derive(Debug, thiserror::Error)]
enum ActionError {
    #[error("{0}")]
    Validation(#[from] ValidationError),

    #[error("{0}")]
    Driver(String),
}

impl ActionError {
    const fn code(&self) -> ActionErrorCode {
        match self {
            Self::Validation(_) => ActionErrorCode::Validation,
            Self::Driver(_) => ActionErrorCode::DriverError,
        }
    }
}

/// Executes allowlisted actions against fleet routers.
pub struct ActionHandler {
    driver: Arc<dyn RouterDriver>,
    circuit: Arc<CircuitBreaker>,
    metrics: Arc<Metrics>,
    routers: HashMap<String, RouterConfig>,
}

impl ActionHandler {
    pub fn new(
        driver: Arc<dyn RouterDriver>,
        circuit: Arc<CircuitBreaker>,
        metrics: Arc<Metrics>,
        routers: &[RouterConfig],
    ) -> Self {
        Self {
            driver,
            circuit,
            metrics,
            routers: routers
                .iter()
                .map(|r| (r.id.clone(), r.clone()))
                .collect(),
        }
    }

    pub fn router(&self, router_id: &str) -> Option<&RouterConfig> {
        self.routers.get(router_id)
    }

    pub fn circuit(&self) -> &CircuitBreaker {
        &self.circuit
    }

    pub fn driver(&self) -> &Arc<dyn RouterDriver> {
        &self.driver
    }

    /// Validate, audit and run one action.
    pub async fn execute(&self, request: ActionRequest) -> ActionResponse {
        let trace_id = request
            .trace_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let source = request.source.as_deref().unwrap_or("api");
        let detail = json!({
            "action": request.action,
            "source": source,
            "payload": request.payload,
        });

        audit::attempt("action", &trace_id, &detail);
        let Ok(kind) = request.action.parse::<ActionKind>() else {
            self.metrics.inc("action.not_allowed");
            audit::fail("action", &trace_id, &detail);
            warn!(action = %request.action, source, trace_id, "Action not allowed");
            return ActionResponse::failure(
                request.action,
                trace_id,
                ActionErrorCode::ActionNotAllowed,
                "action not allowed".to_string(),
            );
        };

        let started = Instant::now();
        let result = match kind {
            ActionKind::AuthorizeBySession => self.authorize(&request.payload).await,
            ActionKind::ResyncDevice => self.resync(&request.payload).await,
            ActionKind::RevokeSession => self.revoke(&request.payload).await,
        };
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match result {
            Ok(result) => {
                self.metrics.inc(&format!("action.{kind}.success"));
                self.metrics.add("latency_ms_total", elapsed_ms);
                audit::success("action", &trace_id, &json!({ "action": kind, "result": result }));
                info!(action = %kind, trace_id, elapsed_ms, "Action succeeded");
                ActionResponse::success(kind.to_string(), trace_id, result)
            }
            Err(e) => {
                self.metrics.inc(&format!("action.{kind}.fail"));
                audit::fail(
                    "action",
                    &trace_id,
                    &json!({ "action": kind, "error": e.to_string() }),
                );
                warn!(action = %kind, trace_id, error = %e, "Action failed");
                ActionResponse::failure(kind.to_string(), trace_id, e.code(), e.to_string())
            }
        }
    }

    fn resolve(&self, router_id: &str) -> Result<&RouterConfig, ValidationError> {
        self.router(router_id)
            .ok_or_else(|| ValidationError(format!("unknown router: {router_id}")))
    }

    async fn authorize(&self, payload: &Value) -> Result<Value, ActionError> {
        let target = GrantTarget::from_payload(payload)?;
        let router = self.resolve(&target.router_id)?;
        self.run(router, &commands::grant(&target)).await?;
        Ok(json!({
            "routerId": target.router_id,
            "pedidoId": target.order_id,
            "ip": target.ip,
            "mac": target.mac,
        }))
    }

    async fn resync(&self, payload: &Value) -> Result<Value, ActionError> {
        let target = GrantTarget::from_payload(payload)?;
        let router = self.resolve(&target.router_id)?;
        self.run(router, &commands::resync(&target)).await?;
        Ok(json!({ "routerId": target.router_id, "mac": target.mac, "resynced": true }))
    }

    async fn revoke(&self, payload: &Value) -> Result<Value, ActionError> {
        let target = RevokeTarget::from_payload(payload)?;
        let router = self.resolve(&target.router_id)?;
        self.run(router, &commands::revoke(&target)).await?;
        Ok(json!({
            "routerId": target.router_id,
            "ip": target.ip,
            "mac": target.mac,
            "revoked": true,
        }))
    }

    async fn run(&self, router: &RouterConfig, cmds: &[RouterCommand]) -> Result<(), ActionError> {
        let report = self.driver.execute(router, cmds).await;
        if report.ok {
            self.circuit.record_success(&router.id);
            self.metrics.inc(&format!("router.{}.success", router.id));
            return Ok(());
        }
        let state = self.circuit.record_failure(&router.id);
        self.metrics.inc(&format!("router.{}.fail", router.id));
        warn!(router_id = %router.id, circuit = %state, errors = report.errors.len(), "Router batch failed");
        let message = report
            .errors
            .iter()
            .map(|e| format!("{}: {}", e.cmd, e.message))
            .collect::<Vec<_>>()
            .join("; ");
        Err(ActionError::Driver(message))
    }
}
