//! Service entry point.
//!
//! Loads settings (optional TOML path as the first argument), initializes
//! logging, opens the camera and runs the service until an interrupt or
//! termination signal arrives, then runs the global cleanup.

use anyhow::Result;
use depthcast::config::Settings;
use depthcast::device::mock::MockCamera;
use depthcast::{logging, service};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args().nth(1);
    let settings = Settings::new(config_path.as_deref())?;
    logging::init(&settings.debug).map_err(|err| anyhow::anyhow!(err))?;
    info!("configuration loaded");

    // The mock camera stands in until a hardware SDK adapter is linked.
    let driver = Arc::new(MockCamera::new(&settings.device));

    let handle = service::launch(settings, driver).await?;
    info!(port = handle.port(), "depthcast listening");

    shutdown_signal().await?;
    info!("shutdown signal received");
    handle.shutdown().await;
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
