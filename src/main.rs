//! Audio Relay Server
//!
//! Loads configuration, sets up logging and serves the relay until Ctrl-C,
//! then waits for pending cache writes before exiting.

use anyhow::Context;
use audio_relay::server::{self, AppState};
use audio_relay::{BackgroundTasks, ProxyConfig, ReqwestTransport};
use std::env;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// # Usage
/// ```bash
/// # Defaults plus environment overrides
/// audio-relay
///
/// # Custom config
/// audio-relay /path/to/audio_relay.yaml
/// ```
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Starting Audio Relay");

    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| "audio_relay.yaml".to_string());

    let mut config = if Path::new(&config_path).exists() {
        info!("Loading configuration from: {}", config_path);
        ProxyConfig::from_file(&config_path)
            .with_context(|| format!("invalid configuration in {}", config_path))?
    } else {
        info!("No configuration at {}, using defaults", config_path);
        ProxyConfig::default()
    };
    config.apply_env_overrides();
    config
        .validate()
        .context("invalid configuration after environment overrides")?;

    info!("Configuration loaded successfully");
    info!("  - Listen address: {}", config.listen_address);
    info!("  - Deployment: {}", config.deployment.as_deref().unwrap_or("auto"));
    info!("  - Cache: {} ({})", config.cache.enabled, config.cache.backend);
    info!("  - Custom proxy: {}", config.fallback.custom_proxy().is_some());
    info!("  - Metrics: {}", config.metrics_enabled);

    let addr: SocketAddr = config
        .listen_address
        .parse()
        .with_context(|| format!("invalid listen address {}", config.listen_address))?;

    let tasks = Arc::new(BackgroundTasks::new());
    let transport = Arc::new(ReqwestTransport::new()?);
    let state = Arc::new(AppState::from_config(&config, transport, tasks.clone()).await?);

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
    };

    server::bind_and_serve(addr, state, shutdown).await?;

    info!("Waiting for {} pending cache writes", tasks.pending());
    tasks.drain().await;
    info!("Audio relay stopped");
    Ok(())
}
