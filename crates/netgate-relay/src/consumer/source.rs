//! Where events come from.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use netgate_core::{Metrics, signature};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::jobs::{StoreError, write_json_atomic};

/// Header carrying the relay's request timestamp.
pub const TS_HEADER: &str = "x-relay-ts";
/// Header carrying the relay's HMAC over the request.
pub const RELAY_HMAC_HEADER: &str = "x-relay-hmac";
/// Header carrying the backend's HMAC over the response body.
pub const BACKEND_HMAC_HEADER: &str = "x-backend-hmac";

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Event source returned {0}")]
    Status(u16),

    #[error("Event source signature rejected: {0}")]
    Signature(&'static str),

    #[error("Malformed event batch: {0}")]
    Malformed(String),

    #[error("Queue file error: {0}")]
    Queue(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A batch-oriented, at-least-once event feed.
#[async_trait]
pub trait EventSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// Take the next batch of raw events.
    async fn fetch(&self) -> Result<Vec<Value>, SourceError>;
}

/// Accept a bare array or an `{ "events": [...] }` envelope.
pub fn unwrap_batch(value: Value) -> Result<Vec<Value>, SourceError> {
    match value {
        Value::Array(items) => Ok(items),
        Value::Object(mut map) => match map.remove("events") {
            Some(Value::Array(items)) => Ok(items),
            _ => Err(SourceError::Malformed("expected an events array".to_string())),
        },
        Value::Null => Ok(Vec::new()),
        _ => Err(SourceError::Malformed("expected an array".to_string())),
    }
}

/// Local JSON queue file, drained on every fetch.
pub struct FileQueueSource {
    path: PathBuf,
    // Serializes read-then-truncate within this process.
    lock: Mutex<()>,
}

impl FileQueueSource {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    /// Append events to the queue file.
    pub async fn push(&self, events: &[Value]) -> Result<(), SourceError> {
        let _guard = self.lock.lock().await;
        let mut queued = self.read().await?;
        queued.extend_from_slice(events);
        write_json_atomic(&self.path, &queued).await?;
        Ok(())
    }

    async fn read(&self) -> Result<Vec<Value>, SourceError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }
        let value: Value = serde_json::from_str(&raw)
            .map_err(|e| SourceError::Malformed(format!("{}: {e}", self.path.display())))?;
        unwrap_batch(value)
    }
}

#[async_trait]
impl EventSource for FileQueueSource {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn fetch(&self) -> Result<Vec<Value>, SourceError> {
        let _guard = self.lock.lock().await;
        let events = match self.read().await {
            Ok(events) => events,
            Err(SourceError::Malformed(reason)) => {
                warn!(path = %self.path.display(), reason, "Discarding unreadable event queue");
                Vec::new()
            }
            Err(e) => return Err(e),
        };
        if events.is_empty() && !self.path.exists() {
            return Ok(events);
        }
        write_json_atomic(&self.path, &Vec::<Value>::new()).await?;
        debug!(count = events.len(), "Drained event queue file");
        Ok(events)
    }
}

/// Pulls events from the upstream backend over HTTP.
pub struct HttpEventSource {
    http: reqwest::Client,
    url: String,
    secret: Option<String>,
    require_hmac: bool,
    metrics: Arc<Metrics>,
}

impl HttpEventSource {
    pub fn new(
        url: String,
        secret: Option<String>,
        require_hmac: bool,
        timeout: Duration,
        metrics: Arc<Metrics>,
    ) -> Result<Self, SourceError> {
        // Err only means a provider was already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            url,
            secret: secret.filter(|s| !s.is_empty()),
            require_hmac,
            metrics,
        })
    }

    fn reject(&self, reason: &'static str) -> SourceError {
        self.metrics.inc("consumer.hmac_rejected");
        warn!(url = %self.url, reason, "Event batch rejected");
        SourceError::Signature(reason)
    }
}

#[async_trait]
impl EventSource for HttpEventSource {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn fetch(&self) -> Result<Vec<Value>, SourceError> {
        if self.secret.is_none() && self.require_hmac {
            return Err(self.reject("no secret configured"));
        }
        let mut request = self.http.get(&self.url);
        if let Some(secret) = &self.secret {
            let ts = netgate_core::clock::unix_millis().to_string();
            let mac = signature::sign(secret.as_bytes(), ts.as_bytes())
                .map_err(|_| SourceError::Signature("invalid secret"))?;
            request = request.header(TS_HEADER, ts).header(RELAY_HMAC_HEADER, mac);
        }

        let resp = request.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(SourceError::Status(status.as_u16()));
        }
        let provided = resp
            .headers()
            .get(BACKEND_HMAC_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp.bytes().await?;

        match (&self.secret, provided) {
            (Some(secret), Some(mac)) => {
                if !signature::verify(secret.as_bytes(), &body, &mac) {
                    return Err(self.reject("signature mismatch"));
                }
            }
            (Some(_), None) => return Err(self.reject("missing signature")),
            (None, _) => {}
        }

        if body.is_empty() {
            return Ok(Vec::new());
        }
        let value: Value =
            serde_json::from_slice(&body).map_err(|e| SourceError::Malformed(e.to_string()))?;
        unwrap_batch(value)
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn batches_unwrap_both_shapes() {
        assert_eq!(unwrap_batch(json!([{"a": 1}])).unwrap().len(), 1);
        assert_eq!(
            unwrap_batch(json!({"events": [{"a": 1}, {"b": 2}]}))
                .unwrap()
                .len(),
            2
        );
        assert!(unwrap_batch(json!({"items": []})).is_err());
        assert!(unwrap_batch(json!("nope")).is_err());
    }

    #[tokio::test]
    async fn queue_file_is_drained() {
        let dir = tempfile::tempdir().unwrap();
        let source = FileQueueSource::new(dir.path().join("events_queue.json"));
        assert!(source.fetch().await.unwrap().is_empty());

        source
            .push(&[json!({"eventId": "e1"}), json!({"eventId": "e2"})])
            .await
            .unwrap();
        let events = source.fetch().await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(source.fetch().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unreadable_queue_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events_queue.json");
        std::fs::write(&path, "[{broken").unwrap();
        let source = FileQueueSource::new(path.clone());
        assert!(source.fetch().await.unwrap().is_empty());
        assert_eq!(std::fs::read_to_string(&path).unwrap().trim(), "[]");
    }

    async fn serve(body: &'static str, mac: Option<String>) -> String {
        use axum::Router;
        use axum::http::HeaderMap;
        use axum::routing::get;

        let app = Router::new().route(
            "/events",
            get(move || {
                let mac = mac.clone();
                async move {
                    let mut headers = HeaderMap::new();
                    if let Some(mac) = mac {
                        headers.insert(BACKEND_HMAC_HEADER, mac.parse().unwrap());
                    }
                    (headers, body)
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/events")
    }

    fn source(url: String, secret: Option<&str>, require_hmac: bool) -> (HttpEventSource, Arc<Metrics>) {
        let metrics = Arc::new(Metrics::new());
        let source = HttpEventSource::new(
            url,
            secret.map(str::to_string),
            require_hmac,
            Duration::from_secs(5),
            Arc::clone(&metrics),
        )
        .unwrap();
        (source, metrics)
    }

    const BODY: &str = r#"{"events":[{"eventId":"e1","type":"REVOKE_REQUESTED","payload":{}}]}"#;

    #[tokio::test]
    async fn signed_batch_is_accepted() {
        let mac = signature::sign(b"s3cret", BODY.as_bytes()).unwrap();
        let url = serve(BODY, Some(mac)).await;
        let (source, _) = source(url, Some("s3cret"), false);
        let events = source.fetch().await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["eventId"], "e1");
    }

    #[tokio::test]
    async fn unsigned_batch_fails_closed() {
        let url = serve(BODY, None).await;
        let (source, metrics) = source(url, Some("s3cret"), false);
        assert!(matches!(
            source.fetch().await,
            Err(SourceError::Signature("missing signature"))
        ));
        assert_eq!(metrics.get("consumer.hmac_rejected"), 1);
    }

    #[tokio::test]
    async fn wrong_signature_fails_closed() {
        let mac = signature::sign(b"other", BODY.as_bytes()).unwrap();
        let url = serve(BODY, Some(mac)).await;
        let (source, _) = source(url, Some("s3cret"), false);
        assert!(matches!(
            source.fetch().await,
            Err(SourceError::Signature("signature mismatch"))
        ));
    }

    #[tokio::test]
    async fn require_hmac_without_secret_fails_closed() {
        let (source, metrics) = source("http://127.0.0.1:9/events".to_string(), None, true);
        assert!(matches!(
            source.fetch().await,
            Err(SourceError::Signature("no secret configured"))
        ));
        assert_eq!(metrics.get("consumer.hmac_rejected"), 1);
    }

    #[tokio::test]
    async fn unsigned_source_without_secret_is_trusted() {
        let url = serve("[]", None).await;
        let (source, _) = source(url, None, false);
        assert!(source.fetch().await.unwrap().is_empty());
    }
}
