//! Prometheus counters and gauges behind a dotted-name API.
//!
//! Counter names are dotted (`action.AUTHORIZE_BY_SESSION.success`,
//! `router.R1.fail`) because router ids and action kinds are only known at
//! runtime. Each name is sanitized into a `netgate_`-prefixed metric and
//! registered with the [`Registry`] on first use.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use thiserror::Error;
use tracing::warn;

const PREFIX: &str = "netgate_";

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("failed to register metric: {0}")]
    Registration(#[from] prometheus::Error),

    #[error("failed to encode metrics: {0}")]
    Encoding(String),
}

/// Thread-safe registry of monotonically increasing counters plus
/// point-in-time gauges.
pub struct Metrics {
    registry: Registry,
    counters: Mutex<HashMap<String, IntCounter>>,
    gauges: Mutex<HashMap<String, IntGauge>>,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("families", &self.registry.gather().len())
            .finish()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            registry: Registry::new(),
            counters: Mutex::new(HashMap::new()),
            gauges: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn inc(&self, name: &str) {
        self.add(name, 1);
    }

    /// Increase a counter, saturating at `u64::MAX`.
    pub fn add(&self, name: &str, value: u64) {
        if let Some(counter) = self.counter(name) {
            counter.inc_by(value.min(u64::MAX - counter.get()));
        }
    }

    /// Current value of a counter, zero when it was never touched.
    pub fn get(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&metric_name(name))
            .map_or(0, IntCounter::get)
    }

    fn counter(&self, name: &str) -> Option<IntCounter> {
        let metric = metric_name(name);
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(counter) = counters.get(&metric) {
            return Some(counter.clone());
        }
        match register_counter(&self.registry, &metric, name) {
            Ok(counter) => {
                counters.insert(metric, counter.clone());
                Some(counter)
            }
            Err(e) => {
                warn!(metric = %metric, error = %e, "Counter not registered");
                None
            }
        }
    }

    fn set_gauge(&self, name: &str, value: i64) -> Result<(), MetricsError> {
        let metric = metric_name(name);
        let mut gauges = self.gauges.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(gauge) = gauges.get(&metric) {
            gauge.set(value);
            return Ok(());
        }
        let gauge = IntGauge::new(metric.as_str(), name)?;
        self.registry.register(Box::new(gauge.clone()))?;
        gauge.set(value);
        gauges.insert(metric, gauge);
        Ok(())
    }

    /// Update `gauges` and render every metric in the Prometheus text
    /// format.
    pub fn render(&self, gauges: &[(&str, i64)]) -> Result<String, MetricsError> {
        for (name, value) in gauges {
            self.set_gauge(name, *value)?;
        }
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| MetricsError::Encoding(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::Encoding(e.to_string()))
    }
}

fn register_counter(registry: &Registry, metric: &str, help: &str) -> prometheus::Result<IntCounter> {
    let counter = IntCounter::new(metric, help)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

/// Map a dotted counter name onto `[a-zA-Z0-9_]`.
pub fn metric_name(name: &str) -> String {
    let mut out = String::with_capacity(PREFIX.len() + name.len());
    out.push_str(PREFIX);
    out.extend(name.chars().map(|c| {
        if c.is_ascii_alphanumeric() || c == '_' {
            c
        } else {
            '_'
        }
    }));
    out
}
