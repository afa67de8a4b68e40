//! Configuration shared by the recorder, post-processor and gallery.
//!
//! Configuration is loaded in the following order (later sources override earlier):
//! 1. `config/timelapse.{toml,yaml,json}` or an explicit `--config` file
//! 2. `/etc/timelapse/timelapse.{toml,yaml,json}`
//! 3. Environment variables prefixed with `TIMELAPSE__`
//!    (e.g. `TIMELAPSE__STORAGE__CONTAINER`, `TIMELAPSE__CAPTURE__INTERVAL_SECS`)

use crate::naming::{self, ExposureLevels};
use chrono_tz::Tz;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Main configuration for every timelapse service.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TimelapseConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Naming and local directories of this timelapse
    #[serde(default)]
    pub timelapse: TimelapseSettings,

    /// Camera and capture loop settings
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Catalog scanning policy
    #[serde(default)]
    pub catalog: CatalogConfig,

    /// Blob storage settings
    #[serde(default)]
    pub storage: StorageConfig,

    /// Download policy for the post-processor
    #[serde(default)]
    pub sync: SyncConfig,

    /// Live preview settings
    #[serde(default)]
    pub viewfinder: ViewfinderConfig,

    /// Post-processing settings
    #[serde(default)]
    pub processing: ProcessingConfig,

    /// Browse API settings
    #[serde(default)]
    pub gallery: GalleryConfig,

    /// Prometheus exporter settings
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,
}

/// Identity of the timelapse and where its files live locally.
#[derive(Debug, Clone, Deserialize)]
pub struct TimelapseSettings {
    /// Name used as the top-level blob prefix and local directory
    #[serde(default = "default_timelapse_name")]
    pub name: String,

    /// Scratch directory for fresh captures on the Pi. A ramdisk keeps the SD
    /// card from wearing out; files are deleted once uploaded.
    #[serde(default = "default_local_images_base_path")]
    pub local_images_base_path: PathBuf,

    /// Working directory of the post-processor (downloaded images and output)
    #[serde(default = "default_post_processing_path")]
    pub post_processing_path: PathBuf,

    /// IANA time zone of the camera location, used for day bucketing
    #[serde(default = "default_time_zone")]
    pub time_zone: String,
}

/// Capture loop and camera configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    /// Sensor ISO used for every still
    #[serde(default = "default_iso")]
    pub iso: u32,

    /// Nominal period between bracket starts in seconds
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Bracket as percentages of the metered shutter speed
    #[serde(default = "default_shutter_speed_percents")]
    pub shutter_speed_percents: Vec<u32>,

    /// Wait after changing the shutter speed before capturing
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,

    /// Auto-exposure settling time before the base exposure is read
    #[serde(default = "default_metering_ms")]
    pub metering_ms: u64,

    /// Still width in pixels
    #[serde(default = "default_capture_width")]
    pub width: u32,

    /// Still height in pixels
    #[serde(default = "default_capture_height")]
    pub height: u32,

    /// Image rotation in degrees (0 or 180)
    #[serde(default)]
    pub rotation: u32,

    /// Camera still binary
    #[serde(default = "default_camera_command")]
    pub camera_command: String,

    /// Upper bound for a single camera invocation
    #[serde(default = "default_camera_timeout_secs")]
    pub camera_timeout_secs: u64,

    /// Delete local files once they are uploaded
    #[serde(default = "default_true")]
    pub delete_after_upload: bool,
}

/// Catalog scanning configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogConfig {
    /// Abort a scan on a malformed image name instead of skipping it
    #[serde(default = "default_true")]
    pub strict_names: bool,

    /// Number of series directories read concurrently
    #[serde(default = "default_scan_workers")]
    pub scan_workers: usize,
}

/// Which blob store implementation to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// S3-compatible object storage
    S3,
    /// A local directory standing in for a container
    Local,
}

/// Blob storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Storage implementation
    #[serde(default = "default_backend")]
    pub backend: StorageBackend,

    /// Container (bucket) name
    #[serde(default = "default_container")]
    pub container: String,

    /// Region of the bucket
    #[serde(default = "default_region")]
    pub region: String,

    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,

    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,

    /// Access key; falls back to the standard AWS environment
    pub access_key_id: Option<String>,

    /// Secret key; falls back to the standard AWS environment
    pub secret_access_key: Option<String>,

    /// Root directory for the local backend
    pub local_root: Option<PathBuf>,

    /// Timeout for a single storage request in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Concurrent transfers during download sync
    #[serde(default = "default_transfer_concurrency")]
    pub transfer_concurrency: usize,

    /// Presigned URL expiration in seconds
    #[serde(default = "default_presigned_url_expiry_secs")]
    pub presigned_url_expiry_secs: u64,
}

/// Live preview configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ViewfinderConfig {
    /// HTTP port of the MJPEG stream
    #[serde(default = "default_viewfinder_port")]
    pub port: u16,

    #[serde(default = "default_viewfinder_width")]
    pub width: u32,

    #[serde(default = "default_viewfinder_height")]
    pub height: u32,

    #[serde(default = "default_viewfinder_fps")]
    pub fps: u32,

    #[serde(default = "default_viewfinder_rotation")]
    pub rotation: u32,

    /// Streamer binary
    #[serde(default = "default_viewfinder_command")]
    pub command: String,
}

/// Post-processing configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessingConfig {
    /// Transforms to run, e.g. `hdr_drago`, `hdr_fattal`, `center_bracket`
    #[serde(default = "default_transforms")]
    pub transforms: Vec<String>,

    /// Output video frame rate
    #[serde(default = "default_frame_rate")]
    pub frame_rate: u32,

    /// Number of sets processed concurrently
    #[serde(default = "default_processing_workers")]
    pub workers: usize,

    /// HDR tone-mapping binary
    #[serde(default = "default_hdr_command")]
    pub hdr_command: String,

    /// FFmpeg binary used for overlays and video encoding
    #[serde(default = "default_ffmpeg_command")]
    pub ffmpeg_command: String,

    /// Upper bound for a single external tool invocation
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,

    /// Font size of the timestamp overlay
    #[serde(default = "default_overlay_font_size")]
    pub overlay_font_size: u32,
}

/// Browse API configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct GalleryConfig {
    #[serde(default = "default_gallery_host")]
    pub host: String,

    #[serde(default = "default_gallery_port")]
    pub port: u16,

    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,

    /// Allowed CORS origins (empty = any)
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

/// Download synchronisation configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SyncConfig {
    /// Remove local images that no longer exist in the container
    #[serde(default)]
    pub delete_extraneous: bool,
}

/// Prometheus exporter configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricsConfig {
    /// Serve metrics on this port when set
    pub port: Option<u16>,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}
fn default_timelapse_name() -> String {
    "annolapse1".to_string()
}
fn default_local_images_base_path() -> PathBuf {
    PathBuf::from("/media/ramdisk/timelapse_data")
}
fn default_post_processing_path() -> PathBuf {
    PathBuf::from("./timelapse_data")
}
fn default_time_zone() -> String {
    "Asia/Jerusalem".to_string()
}
fn default_iso() -> u32 {
    200
}
fn default_interval_secs() -> u64 {
    600
}
fn default_shutter_speed_percents() -> Vec<u32> {
    vec![20, 50, 100, 200, 500]
}
fn default_settle_ms() -> u64 {
    1000
}
fn default_metering_ms() -> u64 {
    5000
}
fn default_capture_width() -> u32 {
    3280 / 2
}
fn default_capture_height() -> u32 {
    2464 / 2
}
fn default_camera_command() -> String {
    "rpicam-still".to_string()
}
fn default_camera_timeout_secs() -> u64 {
    60
}
fn default_true() -> bool {
    true
}
fn default_scan_workers() -> usize {
    4
}
fn default_backend() -> StorageBackend {
    StorageBackend::S3
}
fn default_container() -> String {
    "thecontainer".to_string()
}
fn default_region() -> String {
    "us-east-1".to_string()
}
fn default_request_timeout_secs() -> u64 {
    60
}
fn default_transfer_concurrency() -> usize {
    4
}
fn default_presigned_url_expiry_secs() -> u64 {
    3600
}
fn default_viewfinder_port() -> u16 {
    80
}
fn default_viewfinder_width() -> u32 {
    512
}
fn default_viewfinder_height() -> u32 {
    384
}
fn default_viewfinder_fps() -> u32 {
    2
}
fn default_viewfinder_rotation() -> u32 {
    180
}
fn default_viewfinder_command() -> String {
    "mjpg_streamer".to_string()
}
fn default_transforms() -> Vec<String> {
    vec![
        "hdr_drago".to_string(),
        "hdr_fattal".to_string(),
        "center_bracket".to_string(),
    ]
}
fn default_frame_rate() -> u32 {
    30
}
fn default_processing_workers() -> usize {
    2
}
fn default_hdr_command() -> String {
    "luminance-hdr-cli".to_string()
}
fn default_ffmpeg_command() -> String {
    "ffmpeg".to_string()
}
fn default_tool_timeout_secs() -> u64 {
    600
}
fn default_overlay_font_size() -> u32 {
    16
}
fn default_gallery_host() -> String {
    "0.0.0.0".to_string()
}
fn default_gallery_port() -> u16 {
    8080
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for TimelapseSettings {
    fn default() -> Self {
        Self {
            name: default_timelapse_name(),
            local_images_base_path: default_local_images_base_path(),
            post_processing_path: default_post_processing_path(),
            time_zone: default_time_zone(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            iso: default_iso(),
            interval_secs: default_interval_secs(),
            shutter_speed_percents: default_shutter_speed_percents(),
            settle_ms: default_settle_ms(),
            metering_ms: default_metering_ms(),
            width: default_capture_width(),
            height: default_capture_height(),
            rotation: 0,
            camera_command: default_camera_command(),
            camera_timeout_secs: default_camera_timeout_secs(),
            delete_after_upload: true,
        }
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            strict_names: true,
            scan_workers: default_scan_workers(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            container: default_container(),
            region: default_region(),
            endpoint_url: None,
            force_path_style: false,
            access_key_id: None,
            secret_access_key: None,
            local_root: None,
            request_timeout_secs: default_request_timeout_secs(),
            transfer_concurrency: default_transfer_concurrency(),
            presigned_url_expiry_secs: default_presigned_url_expiry_secs(),
        }
    }
}

impl Default for ViewfinderConfig {
    fn default() -> Self {
        Self {
            port: default_viewfinder_port(),
            width: default_viewfinder_width(),
            height: default_viewfinder_height(),
            fps: default_viewfinder_fps(),
            rotation: default_viewfinder_rotation(),
            command: default_viewfinder_command(),
        }
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            transforms: default_transforms(),
            frame_rate: default_frame_rate(),
            workers: default_processing_workers(),
            hdr_command: default_hdr_command(),
            ffmpeg_command: default_ffmpeg_command(),
            tool_timeout_secs: default_tool_timeout_secs(),
            overlay_font_size: default_overlay_font_size(),
        }
    }
}

impl Default for GalleryConfig {
    fn default() -> Self {
        Self {
            host: default_gallery_host(),
            port: default_gallery_port(),
            cors_enabled: true,
            cors_origins: Vec::new(),
        }
    }
}

/// Configuration could not be loaded or is not usable.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ConfigError),

    #[error(transparent)]
    Invalid(#[from] ConfigValidationError),
}

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("Missing storage credentials: {0}")]
    MissingCredentials(String),
}

impl TimelapseConfig {
    /// Load configuration from files and environment variables, then validate it.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigurationError> {
        let mut builder = Config::builder();

        builder = match path {
            Some(path) => builder.add_source(File::from(path).required(true)),
            None => builder
                .add_source(File::with_name("config/timelapse").required(false))
                .add_source(File::with_name("/etc/timelapse/timelapse").required(false)),
        };

        let config: TimelapseConfig = builder
            // TIMELAPSE__STORAGE__CONTAINER -> storage.container
            .add_source(
                Environment::with_prefix("TIMELAPSE")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("capture.shutter_speed_percents")
                    .with_list_parse_key("processing.transforms")
                    .with_list_parse_key("gallery.cors_origins"),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.timelapse.name.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "timelapse.name".to_string(),
            ));
        }
        if self.timelapse.name.contains('/') {
            return Err(ConfigValidationError::InvalidValue {
                field: "timelapse.name".to_string(),
                message: "Name must be a single path component".to_string(),
            });
        }

        self.time_zone()?;
        self.exposure_levels()?;

        if self.capture.interval_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "capture.interval_secs".to_string(),
                message: "Interval must be greater than 0".to_string(),
            });
        }
        if self.capture.rotation != 0 && self.capture.rotation != 180 {
            return Err(ConfigValidationError::InvalidValue {
                field: "capture.rotation".to_string(),
                message: "Rotation must be 0 or 180".to_string(),
            });
        }

        if self.catalog.scan_workers == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "catalog.scan_workers".to_string(),
                message: "At least one worker is required".to_string(),
            });
        }

        match self.storage.backend {
            StorageBackend::S3 => {
                if self.storage.container.is_empty() {
                    return Err(ConfigValidationError::MissingField(
                        "storage.container".to_string(),
                    ));
                }
            }
            StorageBackend::Local => {
                if self.storage.local_root.is_none() {
                    return Err(ConfigValidationError::MissingField(
                        "storage.local_root".to_string(),
                    ));
                }
            }
        }
        if self.storage.transfer_concurrency == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "storage.transfer_concurrency".to_string(),
                message: "At least one concurrent transfer is required".to_string(),
            });
        }

        if self.processing.frame_rate == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "processing.frame_rate".to_string(),
                message: "Frame rate must be greater than 0".to_string(),
            });
        }
        if self.processing.workers == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "processing.workers".to_string(),
                message: "At least one worker is required".to_string(),
            });
        }
        for name in &self.processing.transforms {
            let known = name == "center_bracket"
                || name
                    .strip_prefix("hdr_")
                    .is_some_and(|method| !method.is_empty());
            if !known {
                return Err(ConfigValidationError::InvalidValue {
                    field: "processing.transforms".to_string(),
                    message: format!("Unknown transform {:?}", name),
                });
            }
        }

        Ok(())
    }

    /// Parsed time zone of the camera location.
    pub fn time_zone(&self) -> Result<Tz, ConfigValidationError> {
        self.timelapse
            .time_zone
            .parse::<Tz>()
            .map_err(|e| ConfigValidationError::InvalidValue {
                field: "timelapse.time_zone".to_string(),
                message: e.to_string(),
            })
    }

    /// Parsed exposure bracket.
    pub fn exposure_levels(&self) -> Result<ExposureLevels, ConfigValidationError> {
        ExposureLevels::new(&self.capture.shutter_speed_percents).map_err(|e| {
            ConfigValidationError::InvalidValue {
                field: "capture.shutter_speed_percents".to_string(),
                message: e.to_string(),
            }
        })
    }

    /// `{local_images_base_path}/{name}/images` on the capture device.
    pub fn local_images_dir(&self) -> PathBuf {
        self.timelapse
            .local_images_base_path
            .join(naming::images_prefix(&self.timelapse.name))
    }

    /// `{post_processing_path}/{name}/images` on the processing host.
    pub fn post_processing_images_dir(&self) -> PathBuf {
        self.timelapse
            .post_processing_path
            .join(naming::images_prefix(&self.timelapse.name))
    }

    /// `{post_processing_path}/{name}/processed`
    pub fn processed_dir(&self) -> PathBuf {
        self.timelapse
            .post_processing_path
            .join(naming::processed_prefix(&self.timelapse.name))
    }

    /// Blob prefix of raw captures.
    pub fn remote_images_prefix(&self) -> String {
        naming::images_prefix(&self.timelapse.name)
    }
}

impl CaptureConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn metering_delay(&self) -> Duration {
        Duration::from_millis(self.metering_ms)
    }

    pub fn camera_timeout(&self) -> Duration {
        Duration::from_secs(self.camera_timeout_secs)
    }
}

impl StorageConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn presigned_url_expiry(&self) -> Duration {
        Duration::from_secs(self.presigned_url_expiry_secs)
    }

    /// Make sure some credential source exists before talking to S3.
    pub fn check_credentials(&self) -> Result<(), ConfigValidationError> {
        match (&self.access_key_id, &self.secret_access_key) {
            (Some(_), Some(_)) => Ok(()),
            (Some(_), None) | (None, Some(_)) => Err(ConfigValidationError::MissingCredentials(
                "storage.access_key_id and storage.secret_access_key must be set together"
                    .to_string(),
            )),
            (None, None) => {
                let from_env = std::env::var_os("AWS_ACCESS_KEY_ID").is_some()
                    || std::env::var_os("AWS_PROFILE").is_some()
                    || std::env::var_os("AWS_WEB_IDENTITY_TOKEN_FILE").is_some();
                if from_env {
                    Ok(())
                } else {
                    Err(ConfigValidationError::MissingCredentials(
                        "set storage.access_key_id/secret_access_key or AWS_ACCESS_KEY_ID"
                            .to_string(),
                    ))
                }
            }
        }
    }
}

impl ProcessingConfig {
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }
}
