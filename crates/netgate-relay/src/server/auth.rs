//! Token, signature and rate-limit middleware.

use axum::body::{Body, to_bytes};
use axum::extract::{Request, State};
use axum::http::{HeaderMap, Method};
use axum::middleware::Next;
use axum::response::Response;
use netgate_core::signature;
use subtle::ConstantTimeEq;
use tracing::warn;

use super::AppState;
use super::error::ApiError;

pub const TOKEN_HEADER: &str = "x-relay-token";
pub const SIGNATURE_HEADER: &str = "x-relay-signature";
pub const TS_HEADER: &str = "x-relay-ts";

/// Accepted clock skew for signed requests.
pub const MAX_SKEW_MS: i64 = 300_000;

const MAX_BODY_BYTES: usize = 1024 * 1024;

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Client key for rate limiting: first `x-forwarded-for` hop, else "local".
pub fn client_key(headers: &HeaderMap) -> String {
    header(headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or("local")
        .to_string()
}

/// Message covered by a request signature.
pub fn signing_input(ts: &str, body: &[u8]) -> Vec<u8> {
    let mut input = Vec::with_capacity(ts.len() + 1 + body.len());
    input.extend_from_slice(ts.as_bytes());
    input.push(b'.');
    input.extend_from_slice(body);
    input
}

pub async fn rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let client = client_key(request.headers());
    if !state.limiter.check(&client) {
        state.metrics.inc("api.rate_limited");
        warn!(client = %client, "Rate limit exceeded");
        return Err(ApiError::RateLimited);
    }
    Ok(next.run(request).await)
}

pub async fn require_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let expected = state.auth.token.as_deref().unwrap_or_default();
    let provided = header(request.headers(), TOKEN_HEADER).unwrap_or_default();
    if !token_matches(expected, provided) {
        state.metrics.inc("api.unauthorized");
        return Err(ApiError::Unauthorized);
    }
    Ok(next.run(request).await)
}

/// Verify `x-relay-signature` on mutating requests when an API secret is set.
pub async fn require_signature(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(secret) = state.auth.api_secret.clone().filter(|s| !s.is_empty()) else {
        return Ok(next.run(request).await);
    };
    if matches!(*request.method(), Method::GET | Method::HEAD | Method::OPTIONS) {
        return Ok(next.run(request).await);
    }

    let (parts, body) = request.into_parts();
    let ts = header(&parts.headers, TS_HEADER).unwrap_or_default().to_string();
    let sig = header(&parts.headers, SIGNATURE_HEADER)
        .unwrap_or_default()
        .to_string();
    let fresh = ts
        .parse::<i64>()
        .is_ok_and(|ts| (state.clock.now_ms() - ts).abs() <= MAX_SKEW_MS);
    if !fresh {
        state.metrics.inc("api.bad_signature");
        return Err(ApiError::BadSignature);
    }

    let bytes = to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    if !signature::verify(secret.as_bytes(), &signing_input(&ts, &bytes), &sig) {
        state.metrics.inc("api.bad_signature");
        warn!(path = %parts.uri.path(), "Rejected request with bad signature");
        return Err(ApiError::BadSignature);
    }
    Ok(next.run(Request::from_parts(parts, Body::from(bytes))).await)
}

/// Constant-time token check; an empty expected token never matches.
fn token_matches(expected: &str, provided: &str) -> bool {
    !expected.is_empty() && bool::from(expected.as_bytes().ct_eq(provided.as_bytes()))
}
