//! Timelapse Gallery
//!
//! Read-only JSON API for browsing the captured days and series straight from
//! blob storage, with optional presigned URLs for the images themselves.
//!
//! ```text
//! GET /health
//! GET /api/v1/days                    newest first
//! GET /api/v1/days/{day}              series with image counts
//! GET /api/v1/days/{day}/{series}     images (?include_urls=true)
//! GET /api/v1/latest                  most recent series
//! ```

mod api;

use anyhow::{Context, Result};
use api::{start_api_server, AppState};
use clap::Parser;
use std::path::PathBuf;
use timelapse_common::telemetry::init_logging;
use timelapse_common::{open_blob_store, TimelapseConfig};
use tokio::signal;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "gallery", version, about = "Browse captured timelapse images")]
struct Args {
    /// Configuration file
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = TimelapseConfig::load(args.config.as_deref())
        .context("Failed to load configuration")?;

    init_logging(
        &config.logging,
        &["gallery", "timelapse_gallery", "timelapse_common", "tower_http"],
    )?;

    info!(
        service = "timelapse-gallery",
        version = env!("CARGO_PKG_VERSION"),
        timelapse = %config.timelapse.name,
        "Starting gallery"
    );

    let store = open_blob_store(&config.storage)
        .await
        .context("Failed to open blob storage")?;

    let state = AppState {
        store,
        images_prefix: config.remote_images_prefix(),
        levels: config.exposure_levels()?,
        presigned_url_expiry: config.storage.presigned_url_expiry(),
    };

    start_api_server(state, &config.gallery, shutdown_signal()).await?;

    info!("Gallery stopped");
    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C signal, shutting down"),
        _ = terminate => info!("Received SIGTERM signal, shutting down"),
    }
}
