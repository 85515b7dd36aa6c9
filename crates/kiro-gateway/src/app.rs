use std::sync::Arc;
use std::time::Duration;

use axum::{
    routing::{get, post},
    Router,
};

use kiro_adapter::auth::TokenManager;
use kiro_adapter::debug::DebugSink;
use kiro_adapter::driver::RetryPolicy;
use kiro_adapter::models::ModelCache;
use kiro_core::config::{GatewayConfig, CONNECT_TIMEOUT_SECS};
use kiro_core::error::{GatewayError, Result};

/// Shared per-process state — passed as `Arc<AppState>` to all handlers.
pub struct AppState {
    pub config: GatewayConfig,
    pub tokens: TokenManager,
    pub models: ModelCache,
    pub debug: Arc<DebugSink>,
    pub retry: RetryPolicy,
    /// Shared upstream client. The request timeout is generous because the
    /// upstream streams slowly.
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let tokens = TokenManager::from_config(&config)?;
        let models = ModelCache::new(config.model_cache_ttl, config.default_max_input_tokens);
        let debug = Arc::new(DebugSink::new(
            config.debug_last_request,
            config.debug_dir.clone(),
        ));
        let retry = RetryPolicy::new(config.max_retries, config.base_retry_delay);
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(config.request_timeout))
            .build()
            .map_err(|e| GatewayError::Config(format!("cannot build upstream client: {e}")))?;

        Ok(Self {
            config,
            tokens,
            models,
            debug,
            retry,
            http,
        })
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(crate::http::health::root_handler))
        .route("/health", get(crate::http::health::health_handler))
        .route("/v1/models", get(crate::http::models::list_models))
        .route(
            "/v1/chat/completions",
            post(crate::http::chat::chat_completions),
        )
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
