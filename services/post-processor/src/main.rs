//! Timelapse Post-Processor
//!
//! Turns captured brackets into titled frames and one video per transform.
//!
//! # Architecture
//!
//! ```text
//! BlobStore --download_missing--> local images --read_catalog--> Catalog
//!                                                                   │
//!               DailySelector (one set per local day, noon or later)
//!                                                                   │
//!      Transform (hdr_<method> | center_bracket) -> overlay -> processed/{day}/{series}/{transform}/img.bmp
//!                                                                   │
//!                                       processed/{transform}.mp4 <─┘
//! ```

mod driver;
mod tools;
mod transform;
mod video;

use anyhow::{Context, Result};
use clap::Parser;
use driver::{PostProcessor, Selection};
use std::path::PathBuf;
use std::sync::Arc;
use timelapse_common::catalog::{read_catalog, ScanOptions};
use timelapse_common::sync::{download_missing, DownloadOptions};
use timelapse_common::telemetry::init_logging;
use timelapse_common::{open_blob_store, DailySelector, TimelapseConfig};
use tools::ToolRunner;
use tracing::info;
use transform::Transform;

#[derive(Debug, Parser)]
#[command(name = "post-processor", version, about = "Build HDR frames and timelapse videos")]
struct Args {
    /// Configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Fetch images missing locally from blob storage first
    #[arg(long)]
    download: bool,

    /// Only download days starting with this prefix, e.g. `2022-03`
    #[arg(long, requires = "download")]
    day: Option<String>,

    /// Remove local images that are gone from blob storage (overrides `sync.delete_extraneous`)
    #[arg(long, requires = "download")]
    delete_extraneous: bool,

    /// Rebuild frames that already exist
    #[arg(long)]
    overwrite: bool,

    /// Use every full set instead of one per day
    #[arg(long)]
    every_set: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = TimelapseConfig::load(args.config.as_deref())
        .context("Failed to load configuration")?;

    init_logging(
        &config.logging,
        &["post_processor", "timelapse_post_processor", "timelapse_common"],
    )?;

    info!(
        service = "timelapse-post-processor",
        version = env!("CARGO_PKG_VERSION"),
        timelapse = %config.timelapse.name,
        "Starting post-processor"
    );

    let levels = config.exposure_levels()?;
    let transforms =
        Transform::parse_all(&config.processing.transforms).context("Invalid processing.transforms")?;
    let images_dir = config.post_processing_images_dir();

    if args.download {
        let store = open_blob_store(&config.storage)
            .await
            .context("Failed to open blob storage")?;
        let options = DownloadOptions {
            day_prefix: args.day.clone(),
            delete_extraneous: args.delete_extraneous || config.sync.delete_extraneous,
            ..DownloadOptions::from_config(&config)
        };
        let report = download_missing(
            store.as_ref(),
            &config.remote_images_prefix(),
            &images_dir,
            &options,
        )
        .await
        .context("Failed to download images")?;
        info!(
            listed = report.listed,
            downloaded = report.downloaded,
            skipped = report.skipped,
            deleted = report.deleted,
            "Download complete"
        );
    }

    let catalog = read_catalog(&images_dir, &levels, ScanOptions::from(&config.catalog))
        .await
        .context("Failed to read image catalog")?;

    let processor = PostProcessor::new(
        Arc::new(ToolRunner::new(&config.processing)),
        DailySelector::from_config(&config)?,
        levels,
        transforms,
        config.processed_dir(),
        config.processing.workers,
        config.processing.frame_rate,
        args.overwrite,
    );

    let selection = if args.every_set {
        Selection::EverySet
    } else {
        Selection::Daily
    };
    let summary = processor
        .run(&catalog, selection)
        .await
        .context("Post-processing failed")?;

    info!(
        sets = summary.sets,
        created = summary.frames.created,
        skipped = summary.frames.skipped,
        videos = summary.videos.len(),
        output = %processor.processed_dir().display(),
        "Post-processing complete"
    );

    Ok(())
}
