//! Camera driver abstraction and the single-owner session used for one bracket.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use timelapse_common::config::CaptureConfig;
use timelapse_common::{ExposureLevel, ExternalCommand, ExternalToolError};
use tracing::{debug, warn};

/// Errors from the camera. A failed bracket is logged and skipped; the next
/// cycle starts fresh.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("camera command failed: {0}")]
    Tool(#[from] ExternalToolError),

    #[error("unreadable camera metadata: {0}")]
    Metadata(String),

    #[error("metered base exposure is zero")]
    NoExposure,

    #[error("capture requested before the exposure was locked")]
    NotLocked,

    #[error("camera produced no image at {}", .0.display())]
    MissingOutput(PathBuf),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// What auto exposure settled on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Metering {
    pub base_shutter_us: u64,
    /// Red and blue white-balance gains
    pub awb_gains: (f64, f64),
}

/// Fixed exposure applied to the following captures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExposureSettings {
    pub iso: u32,
    pub shutter_us: u64,
    pub awb_gains: (f64, f64),
}

/// A camera that can meter, lock an exposure and capture stills.
#[async_trait]
pub trait CameraDriver: Send + Sync {
    /// Run auto exposure at `iso` for `settle` and report the result.
    async fn meter(&self, iso: u32, settle: Duration) -> Result<Metering, CaptureError>;

    /// Lock shutter speed and white balance for subsequent captures.
    async fn set_exposure(&self, settings: ExposureSettings) -> Result<(), CaptureError>;

    /// Write one still to `path`.
    async fn capture(&self, path: &Path) -> Result<(), CaptureError>;

    /// Return to automatic mode.
    async fn reset(&self) -> Result<(), CaptureError>;
}

/// Exclusive use of the camera for one bracket.
///
/// Call [`CameraSession::release`] on every exit path; dropping an unreleased
/// session only logs a warning because reset is async.
pub struct CameraSession<'a> {
    driver: &'a dyn CameraDriver,
    iso: u32,
    metering: Metering,
    released: bool,
}

impl<'a> CameraSession<'a> {
    /// Meter the scene and lock white balance.
    pub async fn open(
        driver: &'a dyn CameraDriver,
        iso: u32,
        metering_delay: Duration,
    ) -> Result<CameraSession<'a>, CaptureError> {
        let metering = match driver.meter(iso, metering_delay).await {
            Ok(m) if m.base_shutter_us > 0 => m,
            Ok(_) => {
                reset_quietly(driver).await;
                return Err(CaptureError::NoExposure);
            }
            Err(e) => {
                reset_quietly(driver).await;
                return Err(e);
            }
        };

        debug!(
            base_shutter_us = metering.base_shutter_us,
            awb_red = metering.awb_gains.0,
            awb_blue = metering.awb_gains.1,
            "Exposure metered"
        );

        Ok(Self {
            driver,
            iso,
            metering,
            released: false,
        })
    }

    pub fn metering(&self) -> Metering {
        self.metering
    }

    /// Capture one still at `level`, waiting `settle` after the exposure change.
    /// Returns the shutter time used.
    pub async fn capture_at(
        &mut self,
        level: ExposureLevel,
        settle: Duration,
        path: &Path,
    ) -> Result<u64, CaptureError> {
        let shutter_us = level.scale_shutter_us(self.metering.base_shutter_us);
        self.driver
            .set_exposure(ExposureSettings {
                iso: self.iso,
                shutter_us,
                awb_gains: self.metering.awb_gains,
            })
            .await?;

        tokio::time::sleep(settle).await;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| CaptureError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        self.driver.capture(path).await?;
        Ok(shutter_us)
    }

    /// Reset the camera and end the session.
    pub async fn release(mut self) -> Result<(), CaptureError> {
        self.released = true;
        self.driver.reset().await
    }
}

impl Drop for CameraSession<'_> {
    fn drop(&mut self) {
        if !self.released {
            warn!("Camera session dropped without release");
        }
    }
}

async fn reset_quietly(driver: &dyn CameraDriver) {
    if let Err(e) = driver.reset().await {
        warn!(error = %e, "Camera reset failed");
    }
}

/// Frame metadata written by `rpicam-still --metadata`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct FrameMetadata {
    exposure_time: u64,
    colour_gains: [f64; 2],
}

fn parse_metadata(json: &str) -> Result<Metering, CaptureError> {
    let metadata: FrameMetadata =
        serde_json::from_str(json).map_err(|e| CaptureError::Metadata(e.to_string()))?;
    Ok(Metering {
        base_shutter_us: metadata.exposure_time,
        awb_gains: (metadata.colour_gains[0], metadata.colour_gains[1]),
    })
}

/// Delete a file left over from an earlier run; a missing file is fine.
async fn remove_stale(path: &Path) -> Result<(), CaptureError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(CaptureError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Drives the Raspberry Pi camera through the `rpicam-still` command.
///
/// Every call is a separate process, so the locked exposure is kept here and
/// passed explicitly on each capture.
pub struct RpicamDriver {
    command: String,
    width: u32,
    height: u32,
    rotation: u32,
    timeout: Duration,
    scratch_dir: PathBuf,
    locked: Mutex<Option<ExposureSettings>>,
}

impl RpicamDriver {
    pub fn new(config: &CaptureConfig, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            command: config.camera_command.clone(),
            width: config.width,
            height: config.height,
            rotation: config.rotation,
            timeout: config.camera_timeout(),
            scratch_dir: scratch_dir.into(),
            locked: Mutex::new(None),
        }
    }

    fn base_command(&self, iso: u32) -> ExternalCommand {
        ExternalCommand::new(&self.command)
            .arg("--nopreview")
            .option("--width", self.width.to_string())
            .option("--height", self.height.to_string())
            .option("--rotation", self.rotation.to_string())
            .option("--gain", format!("{:.2}", iso as f64 / 100.0))
            .timeout(self.timeout)
    }
}

#[async_trait]
impl CameraDriver for RpicamDriver {
    async fn meter(&self, iso: u32, settle: Duration) -> Result<Metering, CaptureError> {
        tokio::fs::create_dir_all(&self.scratch_dir)
            .await
            .map_err(|source| CaptureError::Io {
                path: self.scratch_dir.clone(),
                source,
            })?;
        let metadata_path = self.scratch_dir.join("metering.json");
        let preview_path = self.scratch_dir.join("metering.jpg");
        remove_stale(&metadata_path).await?;

        self.base_command(iso)
            .option("--timeout", settle.as_millis().max(1).to_string())
            .option("--metadata", &metadata_path)
            .option("--metadata-format", "json")
            .option("--output", &preview_path)
            .run()
            .await?;

        let json = tokio::fs::read_to_string(&metadata_path)
            .await
            .map_err(|source| CaptureError::Io {
                path: metadata_path.clone(),
                source,
            })?;
        let _ = tokio::fs::remove_file(&preview_path).await;

        parse_metadata(&json)
    }

    async fn set_exposure(&self, settings: ExposureSettings) -> Result<(), CaptureError> {
        *self.locked.lock() = Some(settings);
        Ok(())
    }

    async fn capture(&self, path: &Path) -> Result<(), CaptureError> {
        let settings = (*self.locked.lock()).ok_or(CaptureError::NotLocked)?;
        let (red, blue) = settings.awb_gains;

        self.base_command(settings.iso)
            .option("--shutter", settings.shutter_us.to_string())
            .option("--awbgains", format!("{:.4},{:.4}", red, blue))
            .arg("--immediate")
            .option("--output", path)
            .run()
            .await?;

        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Err(CaptureError::MissingOutput(path.to_path_buf()));
        }
        Ok(())
    }

    async fn reset(&self) -> Result<(), CaptureError> {
        *self.locked.lock() = None;
        Ok(())
    }
}
