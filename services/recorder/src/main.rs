//! Timelapse Recorder
//!
//! Runs on the Raspberry Pi. Every interval it captures one bracket of stills
//! at fixed fractions of the metered exposure, then pushes everything on the
//! local ramdisk to blob storage.
//!
//! # Architecture
//!
//! ```text
//! CaptureScheduler -> capture_bracket -> CameraDriver (rpicam-still)
//!        │
//!        └──────────> upload_pending -> BlobStore ({name}/images/{date}/{series}/...)
//! ```
//!
//! With `--view` it instead serves a live MJPEG preview for aiming the camera.
//!
//! # Configuration
//!
//! Configuration is loaded from:
//! 1. `--config PATH`, or `config/timelapse.*` and `/etc/timelapse/timelapse.*`
//! 2. Environment variables (prefixed with `TIMELAPSE__`)

mod bracket;
mod camera;
mod scheduler;
mod viewfinder;

use anyhow::{Context, Result};
use bracket::BracketPlan;
use camera::RpicamDriver;
use clap::Parser;
use scheduler::{CaptureScheduler, UploadTarget};
use std::path::PathBuf;
use std::sync::Arc;
use timelapse_common::blob_store::open_blob_store;
use timelapse_common::telemetry::init_logging;
use timelapse_common::TimelapseConfig;
use tokio::signal;
use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "recorder", version, about = "Bracketed-exposure timelapse recorder")]
struct Args {
    /// Configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Serve a live preview instead of capturing
    #[arg(long)]
    view: bool,

    /// Port of the live preview (defaults to viewfinder.port)
    #[arg(long)]
    port: Option<u16>,

    /// Stop after this many capture cycles
    #[arg(long)]
    cycles: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = TimelapseConfig::load(args.config.as_deref())
        .context("Failed to load configuration")?;

    // Initialize logging
    init_logging(&config.logging, &["recorder", "timelapse_common"])?;

    info!(
        service = "timelapse-recorder",
        version = env!("CARGO_PKG_VERSION"),
        timelapse = %config.timelapse.name,
        "Starting recorder"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    if args.view {
        let port = args.port.unwrap_or(config.viewfinder.port);
        viewfinder::run_viewfinder(&config.viewfinder, port, shutdown_rx)
            .await
            .context("Viewfinder failed")?;
        return Ok(());
    }

    if let Some(port) = config.metrics.port {
        init_metrics(port)?;
    }
    scheduler::describe_metrics();

    let store = open_blob_store(&config.storage)
        .await
        .context("Failed to open blob storage")?;

    let plan = BracketPlan::from_config(&config.capture)?;
    let camera = Arc::new(RpicamDriver::new(
        &config.capture,
        config.timelapse.local_images_base_path.join(".camera"),
    ));

    let scheduler = CaptureScheduler::new(
        camera,
        store,
        plan,
        config.capture.interval(),
        UploadTarget {
            images_dir: config.local_images_dir(),
            remote_prefix: config.remote_images_prefix(),
            delete_after_upload: config.capture.delete_after_upload,
        },
    );

    let stats = scheduler.run(shutdown_rx, args.cycles).await;

    info!(
        cycles = stats.cycles,
        captures = stats.captures,
        capture_failures = stats.capture_failures,
        upload_failures = stats.upload_failures,
        "Recorder stopped"
    );

    Ok(())
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

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
        _ = ctrl_c => {
            info!("Received Ctrl+C signal, finishing current cycle");
        }
        _ = terminate => {
            info!("Received SIGTERM signal, finishing current cycle");
        }
    }
}
