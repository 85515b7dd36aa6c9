//! Bearer gating for the /v1 routes.

use axum::http::HeaderMap;

use kiro_core::error::GatewayError;

/// Check the `Authorization: Bearer` header against the configured proxy
/// key. With no key configured the gate is open (logged at startup).
pub fn require_proxy_key(
    expected: Option<&str>,
    headers: &HeaderMap,
) -> Result<(), GatewayError> {
    let Some(expected) = expected else {
        return Ok(());
    };

    let presented = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match presented {
        Some(key) if key == expected => Ok(()),
        _ => Err(GatewayError::ProxyAuthMissing),
    }
}
