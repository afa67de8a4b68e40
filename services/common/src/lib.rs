//! Timelapse Common
//!
//! Shared building blocks of the timelapse pipeline: the recorder on the
//! Raspberry Pi, the post-processor and the gallery API all agree on one
//! naming scheme and one storage layout, which live here.
//!
//! ## Features
//!
//! - **Naming Codec**: `(capture timestamp, exposure level)` to
//!   `{date}/{series}/{series}--shutter_{NNN}.jpg` and back
//! - **Catalog Reader**: groups captured stills into exposure sets and flags
//!   partial ones
//! - **Daily Selector**: one representative set per local calendar day, the
//!   first one at or after local noon
//! - **Blob Storage**: S3-compatible and local-directory stores behind one trait,
//!   plus upload/download sync of the image hierarchy
//!
//! ## Architecture
//!
//! ```text
//!   Recorder                  Blob Store                 Post-processor
//! ┌──────────────┐          ┌────────────────┐          ┌──────────────┐
//! │ bracket      │  upload  │ {name}/images/ │ download │ catalog      │
//! │ capture      │─────────▶│   {date}/      │─────────▶│ reader       │
//! └──────────────┘          │   {series}/    │          └──────────────┘
//!                           └────────────────┘                 │
//!                                   │                          ▼
//!                                   ▼                   ┌──────────────┐
//!                           ┌────────────────┐          │ daily        │
//!                           │ Gallery API    │          │ selector     │
//!                           └────────────────┘          └──────────────┘
//! ```

pub mod blob_store;
pub mod catalog;
pub mod command;
pub mod config;
pub mod naming;
pub mod s3_store;
pub mod selector;
pub mod sync;
pub mod telemetry;

pub use blob_store::{open_blob_store, BlobStore, LocalBlobStore, TransferError};
pub use catalog::{
    group_images, read_catalog, CapturedImage, Catalog, CatalogError, ExposureSet, ScanOptions,
};
pub use command::{ExternalCommand, ExternalToolError};
pub use config::{ConfigValidationError, ConfigurationError, TimelapseConfig};
pub use naming::{CaptureTimestamp, ExposureLevel, ExposureLevels, MalformedName};
pub use s3_store::S3BlobStore;
pub use selector::{DailySelector, DayBucket};
pub use sync::{download_missing, upload_pending, DownloadOptions, DownloadReport, UploadReport};
