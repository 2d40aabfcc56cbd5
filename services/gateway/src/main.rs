//! Gemini key-pool gateway
//!
//! Single-binary service that:
//! 1. Loads a fixed set of upstream API keys from env vars or a keys file
//! 2. Distributes generation requests across them with per-key rate tracking,
//!    cooldown on failure, and bounded cross-key retry
//! 3. Exposes pool health and status for monitoring

mod api;
mod config;
mod metrics;
mod upstream;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::routing::{get, post};
use common::Secret;
use keypool::KeyPool;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::api::{AppState, KeySource};
use crate::config::Config;
use crate::upstream::GeminiClient;

/// Build the axum router with all routes and shared state.
///
/// The concurrency limit layer enforces `max_connections` across every route.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(api::health))
        .route("/metrics", get(api::metrics_endpoint))
        .route("/api/pool/status", get(api::pool_status))
        .route("/api/generate", post(api::generate))
        .route("/api/generate/stream", post(api::generate_stream))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

/// Resolve the key source from config and environment.
///
/// Pooling enabled requires at least one key. Pooling disabled takes the
/// first configured key and bypasses the scheduler entirely.
fn build_key_source(config: &Config) -> Result<KeySource> {
    let keys = config.load_api_keys()?;
    if config.pool.enabled {
        if keys.is_empty() {
            anyhow::bail!(
                "no API keys configured; set GEMINI_API_KEY (and GEMINI_API_KEY_2, ...) or pool.keys_file"
            );
        }
        info!(keys = keys.len(), "key pooling enabled");
        Ok(KeySource::Pool(Arc::new(KeyPool::new(
            keys,
            config.pool.pool_config(),
        ))))
    } else {
        let key = keys
            .into_iter()
            .next()
            .context("pooling disabled but no GEMINI_API_KEY configured")?;
        info!("key pooling disabled, single-key mode");
        Ok(KeySource::Single(Secret::new(key)))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting gemini-pool-gateway");

    // Install the Prometheus recorder before any metrics are emitted
    let prometheus = metrics::install_recorder();

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(String::as_str);

    let config_path = Config::resolve_path(cli_config);
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    let key_source = build_key_source(&config)?;

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.upstream.timeout_secs))
        .build()
        .context("failed to build HTTP client")?;
    let client = GeminiClient::new(
        http,
        &config.upstream.url,
        &config.upstream.model,
        Duration::from_secs(config.upstream.timeout_secs),
    );

    let state = AppState {
        keys: Arc::new(key_source),
        client: Arc::new(client),
        prometheus,
    };
    let router = build_router(state, config.server.max_connections);

    let listener = TcpListener::bind(config.server.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.server.listen_addr))?;
    info!(addr = %config.server.listen_addr, "listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
