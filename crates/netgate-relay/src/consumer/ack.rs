//! Best-effort acknowledgement of processed events.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use netgate_core::{Metrics, signature};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::source::{RELAY_HMAC_HEADER, TS_HEADER};

/// Body posted back to the event source.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    pub event_id: String,
    pub ok: bool,
    pub payload: Value,
}

#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Deliver `ack`; returns whether the upstream accepted it.
    async fn ack(&self, ack: &Ack) -> bool;
}

/// POSTs acknowledgements with a bounded number of retries.
pub struct HttpAcknowledger {
    http: reqwest::Client,
    url: String,
    secret: Option<String>,
    retries: u32,
    retry_delay: Duration,
    metrics: Arc<Metrics>,
}

impl HttpAcknowledger {
    pub fn new(
        url: String,
        secret: Option<String>,
        retries: u32,
        retry_delay: Duration,
        timeout: Duration,
        metrics: Arc<Metrics>,
    ) -> Result<Self, reqwest::Error> {
        // Err only means a provider was already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            url,
            secret: secret.filter(|s| !s.is_empty()),
            retries,
            retry_delay,
            metrics,
        })
    }

    async fn post(&self, body: &[u8]) -> Result<(), String> {
        let mut request = self
            .http
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.to_vec());
        if let Some(secret) = &self.secret {
            let mac = signature::sign(secret.as_bytes(), body).map_err(|e| e.to_string())?;
            request = request
                .header(TS_HEADER, netgate_core::clock::unix_millis().to_string())
                .header(RELAY_HMAC_HEADER, mac);
        }
        let resp = request.send().await.map_err(|e| e.to_string())?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(format!("status {}", resp.status().as_u16()))
        }
    }
}

#[async_trait]
impl Acknowledger for HttpAcknowledger {
    async fn ack(&self, ack: &Ack) -> bool {
        let body = match serde_json::to_vec(ack) {
            Ok(body) => body,
            Err(e) => {
                warn!(event_id = %ack.event_id, error = %e, "Could not encode ack");
                return false;
            }
        };
        for attempt in 0..=self.retries {
            match self.post(&body).await {
                Ok(()) => {
                    debug!(event_id = %ack.event_id, attempt, "Event acknowledged");
                    return true;
                }
                Err(e) => {
                    debug!(event_id = %ack.event_id, attempt, error = %e, "Ack attempt failed");
                    if attempt < self.retries {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }
        self.metrics.inc("consumer.ack_failed");
        warn!(event_id = %ack.event_id, retries = self.retries, "Giving up on event ack");
        false
    }
}
