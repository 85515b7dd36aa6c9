use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{info, warn};

mod app;
mod auth;
mod http;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "kiro_gateway=info,kiro_adapter=info,tower_http=debug".into()
            }),
        )
        .init();

    let config = kiro_core::config::GatewayConfig::load()?;
    if config.proxy_api_key.is_none() {
        warn!("PROXY_API_KEY not set — /v1 routes are unauthenticated");
    }

    let host = config.host.clone();
    let port = config.port;
    let state = Arc::new(app::AppState::new(config)?);
    let router = app::build_router(state.clone());

    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    info!(%addr, region = state.tokens.region(), "kiro gateway listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}
