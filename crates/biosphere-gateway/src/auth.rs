//! Gateway authentication — bearer token validation

use axum::http::HeaderMap;
use tracing::warn;

/// Validate a bearer token against the configured gateway token.
///
/// An empty configured token disables auth.
pub fn validate_token(configured_token: &str, provided_token: &str) -> bool {
    if configured_token.is_empty() {
        return true;
    }
    if provided_token.is_empty() {
        warn!("Gateway auth: no token provided");
        return false;
    }
    constant_time_eq(configured_token.as_bytes(), provided_token.as_bytes())
}

/// Extract the token from an `Authorization: Bearer <token>` value
pub fn extract_bearer_token(header_value: &str) -> Option<&str> {
    let token = header_value.trim().strip_prefix("Bearer ")?.trim();
    if token.is_empty() { None } else { Some(token) }
}

/// Check request headers, falling back to a `token` query parameter for
/// browser WebSocket clients that cannot set headers.
pub fn check_auth(configured_token: &str, headers: &HeaderMap, query_token: Option<&str>) -> bool {
    if configured_token.is_empty() {
        return true;
    }
    let header_token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(extract_bearer_token);

    match header_token.or(query_token) {
        Some(t) => validate_token(configured_token, t),
        None => {
            warn!("Gateway auth: missing bearer token");
            false
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |diff, (x, y)| diff | (x ^ y)) == 0
}
