pub mod chat;
pub mod health;
pub mod models;

use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use kiro_core::error::GatewayError;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Render a gateway error as an OpenAI-style error body with the mapped
/// status code.
pub fn error_response(err: &GatewayError) -> (StatusCode, Json<Value>) {
    let status = StatusCode::from_u16(err.status_code())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        Json(json!({
            "error": {
                "message": err.to_string(),
                "type": err.error_type(),
            }
        })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_statuses_follow_the_taxonomy() {
        let (status, _) = error_response(&GatewayError::ProxyAuthMissing);
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = error_response(&GatewayError::Validation("bad".into()));
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        let (status, _) = error_response(&GatewayError::Upstream {
            status: 400,
            body: "x".into(),
        });
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        let (status, _) = error_response(&GatewayError::UpstreamUnavailable {
            attempts: 3,
            last: "x".into(),
        });
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let (status, _) = error_response(&GatewayError::Timeout { ms: 1 });
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    }
}
