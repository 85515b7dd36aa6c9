use axum::Json;
use serde_json::{json, Value};

/// GET / — service banner.
pub async fn root_handler() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "message": "Kiro OpenAI Gateway",
        "version": super::VERSION,
    }))
}

/// GET /health — liveness probe.
pub async fn health_handler() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": super::VERSION,
    }))
}
