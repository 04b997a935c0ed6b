use std::net::TcpListener;

use anyhow::Context;
use dotenv::dotenv;
use tracing::info;
use tracing_subscriber::EnvFilter;
use ws_sse_bridge::session::spawn_reaper;
use ws_sse_bridge::{run, AppState, Settings};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    // Load configuration
    let config = Settings::new().context("Failed to load configuration")?;
    info!("Configuration loaded successfully ({})", config.environment);

    let state = AppState::new(config.clone())?;

    // Evict idle sessions in the background
    let reaper = spawn_reaper(
        state.registry.clone(),
        config.proxy.idle_timeout(),
        config.proxy.reap_interval(),
    );

    let address = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&address).with_context(|| format!("Failed to bind {}", address))?;
    info!("Starting proxy at http://{}", address);

    run(listener, state.clone())?.await?;

    reaper.abort();
    state.shutdown().await;
    info!("Proxy stopped");
    Ok(())
}
