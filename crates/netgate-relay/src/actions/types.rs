//! Action requests, responses and validated payloads.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[allow(clippy::expect_used)]
static MAC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9A-F]{2}(:[0-9A-F]{2}){5}$").expect("static regex is valid")
});

/// Allowlisted action kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
    /// Grant access for a paid or trial session.
    AuthorizeBySession,
    /// Drop and re-create a client's access entries.
    ResyncDevice,
    /// Remove a client's access.
    RevokeSession,
}

impl ActionKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AuthorizeBySession => "AUTHORIZE_BY_SESSION",
            Self::ResyncDevice => "RESYNC_DEVICE",
            Self::RevokeSession => "REVOKE_SESSION",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AUTHORIZE_BY_SESSION" => Ok(Self::AuthorizeBySession),
            "RESYNC_DEVICE" => Ok(Self::ResyncDevice),
            "REVOKE_SESSION" => Ok(Self::RevokeSession),
            other => Err(other.to_string()),
        }
    }
}

/// Inbound action call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRequest {
    pub action: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub trace_id: Option<String>,
}

impl ActionRequest {
    pub fn new(kind: ActionKind, payload: Value, source: &str, trace_id: &str) -> Self {
        Self {
            action: kind.as_str().to_string(),
            payload,
            source: Some(source.to_string()),
            trace_id: Some(trace_id.to_string()),
        }
    }
}

/// Machine-readable failure class of an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionErrorCode {
    ActionNotAllowed,
    Validation,
    DriverError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionErrorBody {
    pub code: ActionErrorCode,
    pub message: String,
}

/// Outcome of one action call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResponse {
    pub ok: bool,
    pub action: String,
    pub trace_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ActionErrorBody>,
}

impl ActionResponse {
    pub const fn success(action: String, trace_id: String, result: Value) -> Self {
        Self {
            ok: true,
            action,
            trace_id,
            result: Some(result),
            error: None,
        }
    }

    pub const fn failure(
        action: String,
        trace_id: String,
        code: ActionErrorCode,
        message: String,
    ) -> Self {
        Self {
            ok: false,
            action,
            trace_id,
            result: None,
            error: Some(ActionErrorBody { code, message }),
        }
    }

    pub fn error_code(&self) -> Option<ActionErrorCode> {
        self.error.as_ref().map(|e| e.code)
    }
}

/// Payload validation failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ValidationError(pub String);

/// First non-empty string (or number) found under any of `keys`.
pub(crate) fn field(payload: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match payload.get(*key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

pub(crate) fn router_field(payload: &Value) -> Option<String> {
    field(payload, &["routerId", "mikId"])
}

/// Uppercase and check colon-separated hex pairs.
pub fn normalize_mac(raw: &str) -> Result<String, ValidationError> {
    let mac = raw.trim().to_ascii_uppercase();
    if MAC_RE.is_match(&mac) {
        Ok(mac)
    } else {
        Err(ValidationError(format!("invalid mac: {raw}")))
    }
}

pub fn normalize_ip(raw: &str) -> Result<String, ValidationError> {
    raw.trim()
        .parse::<IpAddr>()
        .map(|ip| ip.to_string())
        .map_err(|_| ValidationError(format!("invalid ip: {raw}")))
}

/// Validated target of a grant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantTarget {
    pub order_id: String,
    pub router_id: String,
    pub ip: String,
    pub mac: String,
}

impl GrantTarget {
    pub fn from_payload(payload: &Value) -> Result<Self, ValidationError> {
        let mut missing = Vec::new();
        let order_id = field(payload, &["pedidoId", "orderId"]);
        let router_id = router_field(payload);
        let ip = field(payload, &["ip", "ipAtual"]);
        let mac = field(payload, &["mac", "macAtual"]);
        for (name, value) in [
            ("pedidoId", &order_id),
            ("routerId", &router_id),
            ("ip", &ip),
            ("mac", &mac),
        ] {
            if value.is_none() {
                missing.push(name);
            }
        }
        match (order_id, router_id, ip, mac) {
            (Some(order_id), Some(router_id), Some(ip), Some(mac)) => Ok(Self {
                order_id,
                router_id,
                ip: normalize_ip(&ip)?,
                mac: normalize_mac(&mac)?,
            }),
            _ => Err(ValidationError(format!(
                "missing fields: {}",
                missing.join(", ")
            ))),
        }
    }
}

/// Validated target of a revoke. At least one of `ip`/`mac` is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevokeTarget {
    pub router_id: String,
    pub ip: Option<String>,
    pub mac: Option<String>,
}

impl RevokeTarget {
    pub fn from_payload(payload: &Value) -> Result<Self, ValidationError> {
        let router_id =
            router_field(payload).ok_or_else(|| ValidationError("missing fields: routerId".into()))?;
        let ip = field(payload, &["ip", "ipAtual"])
            .map(|ip| normalize_ip(&ip))
            .transpose()?;
        let mac = field(payload, &["mac", "macAtual"])
            .map(|mac| normalize_mac(&mac))
            .transpose()?;
        if ip.is_none() && mac.is_none() {
            return Err(ValidationError("one of ip or mac is required".into()));
        }
        Ok(Self { router_id, ip, mac })
    }
}
