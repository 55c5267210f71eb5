//! Configuration resolution for netgate.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (`~/.config/netgate/relay.json`)
//! 3. Explicit config file (`--config`)
//! 4. Environment variables (`NETGATE_*`)
//! 5. CLI arguments (applied by the binary, highest priority)
//!
//! [`Config::validate`] is the only place that turns configuration into a
//! fatal startup error.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Complete netgate configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub relay: RelaySettings,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub jobs: JobConfig,
    #[serde(default)]
    pub events: EventConfig,
    #[serde(default)]
    pub circuit: CircuitConfig,
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
    #[serde(default)]
    pub overlay: OverlayConfig,
    #[serde(default)]
    pub routers: Vec<RouterConfig>,
}

/// Process-level settings for the relay.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    /// Shared token required on every operational API call.
    pub token: Option<String>,
    /// Secret for signed mutating API calls.
    pub api_secret: Option<String>,
    /// Refuse to start without every shared secret configured.
    pub strict_security: bool,
    pub listen_addr: String,
    pub data_dir: Option<PathBuf>,
    /// Log router and overlay commands instead of executing them.
    pub dry_run: bool,
    pub rate_limit_per_minute: u32,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            token: None,
            api_secret: None,
            strict_security: false,
            listen_addr: "0.0.0.0:3001".to_string(),
            data_dir: None,
            dry_run: false,
            rate_limit_per_minute: 120,
        }
    }
}

impl fmt::Debug for RelaySettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelaySettings")
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("api_secret", &self.api_secret.as_ref().map(|_| "[REDACTED]"))
            .field("strict_security", &self.strict_security)
            .field("listen_addr", &self.listen_addr)
            .field("data_dir", &self.data_dir)
            .field("dry_run", &self.dry_run)
            .field("rate_limit_per_minute", &self.rate_limit_per_minute)
            .finish()
    }
}

/// Which persistence strategy backs the job store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    File,
    #[default]
    Sqlite,
    Redis,
}

impl FromStr for StoreBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(Self::File),
            "sqlite" => Ok(Self::Sqlite),
            "redis" => Ok(Self::Redis),
            other => Err(Error::Config(format!("unknown store backend: {other}"))),
        }
    }
}

impl fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::File => "file",
            Self::Sqlite => "sqlite",
            Self::Redis => "redis",
        };
        f.write_str(name)
    }
}

/// Job store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub redis_url: Option<String>,
    /// Key prefix for the Redis backend.
    pub namespace: String,
    pub lock_ttl_ms: u64,
    /// Retention for processed event ids. Zero keeps them forever.
    pub processed_ttl_secs: u64,
    pub batch_size: usize,
    pub op_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Sqlite,
            redis_url: None,
            namespace: "netgate".to_string(),
            lock_ttl_ms: 30_000,
            processed_ttl_secs: 7 * 24 * 60 * 60, // 7 days
            batch_size: 50,
            op_timeout_ms: 5_000,
        }
    }
}

/// Job runner settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    pub tick_ms: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub jitter_cap_ms: u64,
    /// Delay before a failed event is replayed.
    pub retry_delay_ms: u64,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            tick_ms: 5_000,
            max_attempts: 5,
            backoff_base_ms: 30_000,
            jitter_cap_ms: 5_000,
            retry_delay_ms: 30_000,
        }
    }
}

/// Upstream event source and acknowledgement settings.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    pub poll_ms: u64,
    /// Pull events over HTTP. When unset the local queue file is used.
    pub source_url: Option<String>,
    pub ack_url: Option<String>,
    pub hmac_secret: Option<String>,
    pub require_hmac: bool,
    pub ack_retries: u32,
    pub ack_retry_delay_ms: u64,
    pub default_trial_minutes: u32,
    /// Reject events for peers whose last handshake is older than this.
    /// Zero disables the check.
    pub offline_max_age_secs: u64,
    pub http_timeout_ms: u64,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            poll_ms: 3_000,
            source_url: None,
            ack_url: None,
            hmac_secret: None,
            require_hmac: false,
            ack_retries: 2,
            ack_retry_delay_ms: 500,
            default_trial_minutes: 5,
            offline_max_age_secs: 300,
            http_timeout_ms: 5_000,
        }
    }
}

impl fmt::Debug for EventConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventConfig")
            .field("poll_ms", &self.poll_ms)
            .field("source_url", &self.source_url)
            .field("ack_url", &self.ack_url)
            .field("hmac_secret", &self.hmac_secret.as_ref().map(|_| "[REDACTED]"))
            .field("require_hmac", &self.require_hmac)
            .field("ack_retries", &self.ack_retries)
            .field("ack_retry_delay_ms", &self.ack_retry_delay_ms)
            .field("default_trial_minutes", &self.default_trial_minutes)
            .field("offline_max_age_secs", &self.offline_max_age_secs)
            .field("http_timeout_ms", &self.http_timeout_ms)
            .finish()
    }
}

/// Circuit breaker thresholds, shared by every router.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    pub failure_threshold: u32,
    pub recovery_ms: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_ms: 60_000,
        }
    }
}

/// Reconciliation loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    pub interval_ms: u64,
    /// Allow removing overlay peers that have no desired counterpart.
    pub remove_extra: bool,
    pub handshake_online_secs: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 60_000,
            remove_extra: false,
            handshake_online_secs: 120,
        }
    }
}

/// `WireGuard` overlay settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    pub interface: String,
    pub wg_binary: String,
    pub command_timeout_ms: u64,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            interface: "wg0".to_string(),
            wg_binary: "wg".to_string(),
            command_timeout_ms: 5_000,
        }
    }
}

/// A fleet router reachable through its REST API.
#[derive(Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    pub id: String,
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_router_user")]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub use_tls: bool,
    #[serde(default = "default_router_timeout")]
    pub timeout_ms: u64,
}

fn default_router_user() -> String {
    "admin".to_string()
}

const fn default_router_timeout() -> u64 {
    8_000
}

impl RouterConfig {
    /// Router with default credentials and timeout.
    pub fn new(id: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port: None,
            username: default_router_user(),
            password: String::new(),
            use_tls: false,
            timeout_ms: default_router_timeout(),
        }
    }

    /// Base URL of the router's REST API.
    pub fn base_url(&self) -> String {
        let scheme = if self.use_tls { "https" } else { "http" };
        match self.port {
            Some(port) => format!("{scheme}://{}:{port}/rest", self.host),
            None => format!("{scheme}://{}/rest", self.host),
        }
    }
}

impl fmt::Debug for RouterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouterConfig")
            .field("id", &self.id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("use_tls", &self.use_tls)
            .field("timeout_ms", &self.timeout_ms)
            .finish()
    }
}

impl Config {
    /// Look up a router by id.
    pub fn router(&self, id: &str) -> Option<&RouterConfig> {
        self.routers.iter().find(|r| r.id == id)
    }

    /// Directory for the database and queue files.
    pub fn data_dir(&self) -> Option<PathBuf> {
        self.relay
            .data_dir
            .clone()
            .or_else(|| dirs::home_dir().map(|h| h.join(".netgate")))
    }

    /// Fail-fast checks run once at startup.
    pub fn validate(&self) -> Result<()> {
        if is_blank(self.relay.token.as_deref()) {
            return Err(Error::Config(
                "relay.token (NETGATE_TOKEN) is required".to_string(),
            ));
        }
        if self.relay.strict_security {
            if is_blank(self.relay.api_secret.as_deref()) {
                return Err(Error::Config(
                    "strict security mode requires relay.api_secret (NETGATE_API_SECRET)"
                        .to_string(),
                ));
            }
            if is_blank(self.events.hmac_secret.as_deref()) {
                return Err(Error::Config(
                    "strict security mode requires events.hmac_secret (NETGATE_BACKEND_SECRET)"
                        .to_string(),
                ));
            }
        }
        if self.store.backend == StoreBackend::Redis && is_blank(self.store.redis_url.as_deref())
        {
            return Err(Error::Config(
                "store.backend = redis requires store.redis_url (NETGATE_REDIS_URL)".to_string(),
            ));
        }
        if self.jobs.max_attempts == 0 {
            return Err(Error::Config("jobs.max_attempts must be at least 1".to_string()));
        }
        let mut seen = HashSet::new();
        for router in &self.routers {
            if router.id.trim().is_empty() || router.host.trim().is_empty() {
                return Err(Error::Config("router id and host must be set".to_string()));
            }
            if !seen.insert(router.id.as_str()) {
                return Err(Error::Config(format!("duplicate router id: {}", router.id)));
            }
        }
        Ok(())
    }
}

fn is_blank(value: Option<&str>) -> bool {
    value.is_none_or(|v| v.trim().is_empty())
}

/// Load configuration with hierarchical resolution.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    if let Some(global_path) = global_config_path() {
        if global_path.exists() {
            let global = load_config_file(&global_path)?;
            merge_config(&mut config, global);
        }
    }

    if let Some(path) = explicit {
        let file = load_config_file(path)?;
        merge_config(&mut config, file);
    }

    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("netgate").join("relay.json"))
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn merge_config(base: &mut Config, mut overlay: Config) {
    if overlay.relay.token.is_some() {
        base.relay.token = overlay.relay.token;
    }
    if overlay.relay.api_secret.is_some() {
        base.relay.api_secret = overlay.relay.api_secret;
    }
    if overlay.relay.data_dir.is_some() {
        base.relay.data_dir = overlay.relay.data_dir;
    }
    base.relay.strict_security |= overlay.relay.strict_security;
    base.relay.dry_run = overlay.relay.dry_run;
    base.relay.listen_addr = overlay.relay.listen_addr;
    base.relay.rate_limit_per_minute = overlay.relay.rate_limit_per_minute;

    let redis_url = overlay.store.redis_url.take().or_else(|| base.store.redis_url.take());
    base.store = overlay.store;
    base.store.redis_url = redis_url;

    let hmac_secret = overlay.events.hmac_secret.take().or_else(|| base.events.hmac_secret.take());
    base.events = overlay.events;
    base.events.hmac_secret = hmac_secret;

    base.jobs = overlay.jobs;
    base.circuit = overlay.circuit;
    base.reconciler = overlay.reconciler;
    base.overlay = overlay.overlay;

    if !overlay.routers.is_empty() {
        base.routers = overlay.routers;
    }
}

fn parse_env<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| Error::Config(format!("invalid value for {key}: {raw:?}")))
}

fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Apply `NETGATE_*` overrides read through `lookup`.
///
/// A malformed numeric value is a configuration error rather than silently
/// falling back to the default.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(v) = lookup("NETGATE_TOKEN") {
        config.relay.token = Some(v);
    }
    if let Some(v) = lookup("NETGATE_API_SECRET") {
        config.relay.api_secret = Some(v);
    }
    if let Some(v) = lookup("NETGATE_STRICT_SECURITY") {
        config.relay.strict_security = parse_flag(&v);
    }
    if let Some(v) = lookup("NETGATE_ADDR") {
        config.relay.listen_addr = v;
    }
    if let Some(v) = lookup("NETGATE_DATA_DIR") {
        config.relay.data_dir = Some(PathBuf::from(v));
    }
    if let Some(v) = lookup("NETGATE_DRY_RUN") {
        config.relay.dry_run = parse_flag(&v);
    }
    if let Some(v) = lookup("NETGATE_RATE_LIMIT") {
        config.relay.rate_limit_per_minute = parse_env("NETGATE_RATE_LIMIT", &v)?;
    }

    if let Some(v) = lookup("NETGATE_STORE") {
        config.store.backend = v.parse()?;
    }
    if let Some(v) = lookup("NETGATE_REDIS_URL") {
        config.store.redis_url = Some(v);
    }
    if let Some(v) = lookup("NETGATE_REDIS_NAMESPACE") {
        config.store.namespace = v;
    }
    if let Some(v) = lookup("NETGATE_LOCK_TTL_MS") {
        config.store.lock_ttl_ms = parse_env("NETGATE_LOCK_TTL_MS", &v)?;
    }
    if let Some(v) = lookup("NETGATE_PROCESSED_TTL_SECS") {
        config.store.processed_ttl_secs = parse_env("NETGATE_PROCESSED_TTL_SECS", &v)?;
    }

    if let Some(v) = lookup("NETGATE_JOB_TICK_MS") {
        config.jobs.tick_ms = parse_env("NETGATE_JOB_TICK_MS", &v)?;
    }
    if let Some(v) = lookup("NETGATE_JOB_MAX_ATTEMPTS") {
        config.jobs.max_attempts = parse_env("NETGATE_JOB_MAX_ATTEMPTS", &v)?;
    }
    if let Some(v) = lookup("NETGATE_JOB_BACKOFF_BASE_MS") {
        config.jobs.backoff_base_ms = parse_env("NETGATE_JOB_BACKOFF_BASE_MS", &v)?;
    }

    if let Some(v) = lookup("NETGATE_EVENTS_POLL_MS") {
        config.events.poll_ms = parse_env("NETGATE_EVENTS_POLL_MS", &v)?;
    }
    if let Some(v) = lookup("NETGATE_EVENTS_URL") {
        config.events.source_url = Some(v);
    }
    if let Some(v) = lookup("NETGATE_ACK_URL") {
        config.events.ack_url = Some(v);
    }
    if let Some(v) = lookup("NETGATE_BACKEND_SECRET") {
        config.events.hmac_secret = Some(v);
    }
    if let Some(v) = lookup("NETGATE_REQUIRE_HMAC") {
        config.events.require_hmac = parse_flag(&v);
    }
    if let Some(v) = lookup("NETGATE_OFFLINE_MAX_AGE_SECS") {
        config.events.offline_max_age_secs = parse_env("NETGATE_OFFLINE_MAX_AGE_SECS", &v)?;
    }

    if let Some(v) = lookup("NETGATE_CIRCUIT_THRESHOLD") {
        config.circuit.failure_threshold = parse_env("NETGATE_CIRCUIT_THRESHOLD", &v)?;
    }
    if let Some(v) = lookup("NETGATE_CIRCUIT_RECOVERY_MS") {
        config.circuit.recovery_ms = parse_env("NETGATE_CIRCUIT_RECOVERY_MS", &v)?;
    }

    if let Some(v) = lookup("NETGATE_RECONCILE_INTERVAL_MS") {
        config.reconciler.interval_ms = parse_env("NETGATE_RECONCILE_INTERVAL_MS", &v)?;
    }
    if let Some(v) = lookup("NETGATE_RECONCILE_REMOVE") {
        config.reconciler.remove_extra = parse_flag(&v);
    }

    if let Some(v) = lookup("NETGATE_WG_INTERFACE") {
        config.overlay.interface = v;
    }

    if let Some(v) = lookup("NETGATE_ROUTERS") {
        config.routers = serde_json::from_str(&v)
            .map_err(|e| Error::Config(format!("invalid NETGATE_ROUTERS: {e}")))?;
    }

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn valid() -> Config {
        let mut config = Config::default();
        config.relay.token = Some("t0ken".to_string());
        config
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.jobs.tick_ms, 5_000);
        assert_eq!(config.jobs.max_attempts, 5);
        assert_eq!(config.jobs.backoff_base_ms, 30_000);
        assert_eq!(config.store.lock_ttl_ms, 30_000);
        assert_eq!(config.store.batch_size, 50);
        assert_eq!(config.circuit.failure_threshold, 5);
        assert_eq!(config.circuit.recovery_ms, 60_000);
        assert_eq!(config.events.default_trial_minutes, 5);
        assert!(!config.reconciler.remove_extra);
    }

    #[test]
    fn missing_token_is_fatal() {
        let err = Config::default().validate().unwrap_err();
        assert!(err.to_string().contains("NETGATE_TOKEN"));
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn strict_mode_requires_secrets() {
        let mut config = valid();
        config.relay.strict_security = true;
        assert!(config.validate().is_err());

        config.relay.api_secret = Some("api".to_string());
        assert!(config.validate().is_err());

        config.events.hmac_secret = Some("backend".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn redis_backend_requires_url() {
        let mut config = valid();
        config.store.backend = StoreBackend::Redis;
        assert!(config.validate().is_err());
        config.store.redis_url = Some("redis://127.0.0.1/".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn duplicate_router_ids_rejected() {
        let mut config = valid();
        let router: RouterConfig =
            serde_json::from_str(r#"{"id":"R1","host":"10.200.0.2"}"#).unwrap();
        config.routers = vec![router.clone(), router];
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = Config::default();
        apply_env_overrides(
            &mut config,
            env(&[
                ("NETGATE_TOKEN", "abc"),
                ("NETGATE_STORE", "redis"),
                ("NETGATE_RECONCILE_REMOVE", "true"),
                ("NETGATE_JOB_MAX_ATTEMPTS", "7"),
                (
                    "NETGATE_ROUTERS",
                    r#"[{"id":"R1","host":"10.200.1.1","password":"pw"}]"#,
                ),
            ]),
        )
        .unwrap();
        assert_eq!(config.relay.token.as_deref(), Some("abc"));
        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert!(config.reconciler.remove_extra);
        assert_eq!(config.jobs.max_attempts, 7);
        let router = config.router("R1").unwrap();
        assert_eq!(router.username, "admin");
        assert_eq!(router.base_url(), "http://10.200.1.1/rest");
    }

    #[test]
    fn malformed_number_is_an_error() {
        let mut config = Config::default();
        let err = apply_env_overrides(&mut config, env(&[("NETGATE_LOCK_TTL_MS", "soon")]));
        assert!(err.is_err());
    }

    #[test]
    fn debug_never_prints_secrets() {
        let mut config = valid();
        config.events.hmac_secret = Some("backend-secret".to_string());
        config.routers = vec![
            serde_json::from_str(r#"{"id":"R1","host":"h","password":"hunter2"}"#).unwrap(),
        ];
        let text = format!("{config:?}");
        assert!(!text.contains("hunter2"));
        assert!(!text.contains("backend-secret"));
        assert!(!text.contains("t0ken"));
    }

    #[test]
    fn config_file_overlays_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.json");
        std::fs::write(
            &path,
            r#"{"relay":{"token":"file-token"},"store":{"backend":"file"},"routers":[{"id":"R1","host":"h","port":8728}]}"#,
        )
        .unwrap();
        let mut config = Config::default();
        merge_config(&mut config, load_config_file(&path).unwrap());
        assert_eq!(config.relay.token.as_deref(), Some("file-token"));
        assert_eq!(config.store.backend, StoreBackend::File);
        assert_eq!(config.store.lock_ttl_ms, 30_000);
        assert_eq!(config.router("R1").unwrap().base_url(), "http://h:8728/rest");
    }

    #[test]
    fn later_file_keeps_secrets_it_does_not_set() {
        let mut config = valid();
        config.store.redis_url = Some("redis://global/".to_string());
        config.events.hmac_secret = Some("global-secret".to_string());

        let overlay: Config =
            serde_json::from_str(r#"{"store":{"backend":"redis"},"events":{"default_trial_minutes":9}}"#)
                .unwrap();
        merge_config(&mut config, overlay);
        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(config.store.redis_url.as_deref(), Some("redis://global/"));
        assert_eq!(config.events.hmac_secret.as_deref(), Some("global-secret"));
        assert_eq!(config.events.default_trial_minutes, 9);

        let overlay: Config =
            serde_json::from_str(r#"{"store":{"redis_url":"redis://local/"}}"#).unwrap();
        merge_config(&mut config, overlay);
        assert_eq!(config.store.redis_url.as_deref(), Some("redis://local/"));
    }
}
