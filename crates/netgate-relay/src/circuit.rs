//! Per-router circuit breaker.
//!
//! ```text
//! CLOSED --(failures >= threshold)--> OPEN --(recovery elapsed)--> HALF
//!   ^                                   ^                            |
//!   |                                   +------(next failure)--------+
//!   +-----------------------(next success)---------------------------+
//! ```
//!
//! State is process-local and lost on restart. It only decides whether new
//! work is attempted against a router, never whether work is correct.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use netgate_core::config::CircuitConfig;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

/// Circuit state for one router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CircuitState {
    Closed,
    Open,
    #[serde(rename = "HALF")]
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF"),
        }
    }
}

/// Thresholds shared by every router.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::from(&CircuitConfig::default())
    }
}

impl From<&CircuitConfig> for CircuitBreakerConfig {
    fn from(config: &CircuitConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            recovery: Duration::from_millis(config.recovery_ms),
        }
    }
}

#[derive(Debug)]
struct RouterCircuit {
    state: CircuitState,
    failures: u32,
    opened_at: Option<Instant>,
}

impl RouterCircuit {
    const fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            opened_at: None,
        }
    }
}

/// Point-in-time view of one router's circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failures: u32,
}

/// Failure isolation for every router, keyed by router id.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    circuits: Mutex<HashMap<String, RouterCircuit>>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            circuits: Mutex::new(HashMap::new()),
        }
    }

    fn with_circuit<T>(&self, router_id: &str, f: impl FnOnce(&mut RouterCircuit) -> T) -> T {
        let mut circuits = self.circuits.lock().unwrap_or_else(PoisonError::into_inner);
        let circuit = circuits
            .entry(router_id.to_string())
            .or_insert_with(RouterCircuit::new);
        f(circuit)
    }

    /// Whether new work may be attempted against `router_id`.
    ///
    /// Once the recovery window has passed an open circuit moves to HALF and
    /// its failure count is reset, letting the next attempt through.
    pub fn allow_request(&self, router_id: &str) -> bool {
        let recovery = self.config.recovery;
        self.with_circuit(router_id, |circuit| match circuit.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = circuit
                    .opened_at
                    .map_or(Duration::MAX, |at| at.elapsed());
                if elapsed >= recovery {
                    circuit.state = CircuitState::HalfOpen;
                    circuit.failures = 0;
                    info!(router_id, "Circuit half-open, allowing trial request");
                    true
                } else {
                    false
                }
            }
        })
    }

    /// Count a failed attempt and return the resulting state.
    pub fn record_failure(&self, router_id: &str) -> CircuitState {
        let threshold = self.config.failure_threshold;
        self.with_circuit(router_id, |circuit| {
            circuit.failures = circuit.failures.saturating_add(1);
            let reopen = circuit.state == CircuitState::HalfOpen;
            if circuit.state != CircuitState::Open && (reopen || circuit.failures >= threshold) {
                circuit.state = CircuitState::Open;
                circuit.opened_at = Some(Instant::now());
                warn!(router_id, failures = circuit.failures, "Circuit opened");
            }
            circuit.state
        })
    }

    /// A successful attempt closes the circuit and clears the count.
    pub fn record_success(&self, router_id: &str) {
        self.with_circuit(router_id, |circuit| {
            if circuit.state != CircuitState::Closed {
                info!(router_id, "Circuit closed");
            }
            *circuit = RouterCircuit::new();
        });
    }

    pub fn snapshot(&self, router_id: &str) -> CircuitSnapshot {
        self.with_circuit(router_id, |circuit| CircuitSnapshot {
            state: circuit.state,
            failures: circuit.failures,
        })
    }

    /// Number of routers whose circuit is currently open.
    pub fn open_count(&self) -> usize {
        self.circuits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|c| c.state == CircuitState::Open)
            .count()
    }
}
