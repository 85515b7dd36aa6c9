//! GET /v1/models — model catalog from the TTL cache.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde_json::Value;

use kiro_adapter::driver::request_with_retry;
use kiro_adapter::models::{parse_model_listing, ModelInfo};
use kiro_adapter::openai::{ModelEntry, ModelList};
use kiro_core::error::{GatewayError, Result};

use crate::app::AppState;
use crate::auth::require_proxy_key;
use crate::http::error_response;

pub async fn list_models(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> std::result::Result<Json<ModelList>, (StatusCode, Json<Value>)> {
    require_proxy_key(state.config.proxy_api_key.as_deref(), &headers)
        .map_err(|e| error_response(&e))?;

    // On a cold or stale cache a single coalesced refill runs; a failed
    // refill installs the static fallback, so the catalog is always served.
    let fetch_state = state.clone();
    state
        .models
        .ensure_fresh(move || async move { fetch_model_listing(fetch_state).await })
        .await;

    let created = chrono::Utc::now().timestamp();
    let data = state
        .models
        .all_ids()
        .into_iter()
        .map(|id| ModelEntry {
            id,
            object: "model",
            created,
            owned_by: "kiro",
        })
        .collect();

    Ok(Json(ModelList {
        object: "list",
        data,
    }))
}

async fn fetch_model_listing(state: Arc<AppState>) -> Result<Vec<ModelInfo>> {
    let url = format!("{}/ListAvailableModels", state.tokens.q_host());
    let resp = request_with_retry(&state.retry, &state.tokens, |token| {
        let mut req = state.http.get(&url).bearer_auth(token);
        for (name, value) in state.tokens.upstream_headers() {
            req = req.header(name, value);
        }
        req.send()
    })
    .await?;

    let body = resp
        .text()
        .await
        .map_err(|e| GatewayError::Network(e.to_string()))?;
    parse_model_listing(&body, state.config.default_max_input_tokens)
}
