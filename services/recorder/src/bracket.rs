//! One bracketed capture: meter once, then one still per exposure level.

use crate::camera::{CameraDriver, CameraSession, CaptureError};
use std::path::{Path, PathBuf};
use std::time::Duration;
use timelapse_common::config::{CaptureConfig, ConfigValidationError};
use timelapse_common::naming;
use timelapse_common::{CaptureTimestamp, ExposureLevels};
use tracing::{info, instrument, warn};

/// Parameters of a bracket, derived from the capture configuration.
#[derive(Debug, Clone)]
pub struct BracketPlan {
    pub iso: u32,
    pub levels: ExposureLevels,
    /// Auto exposure settling time before metering
    pub metering_delay: Duration,
    /// Wait after each exposure change
    pub settle_delay: Duration,
}

impl BracketPlan {
    pub fn from_config(config: &CaptureConfig) -> Result<Self, ConfigValidationError> {
        let levels = ExposureLevels::new(&config.shutter_speed_percents).map_err(|e| {
            ConfigValidationError::InvalidValue {
                field: "capture.shutter_speed_percents".to_string(),
                message: e.to_string(),
            }
        })?;
        Ok(Self {
            iso: config.iso,
            levels,
            metering_delay: config.metering_delay(),
            settle_delay: config.settle_delay(),
        })
    }
}

/// Files written by one bracket.
#[derive(Debug, Clone)]
pub struct CapturedSeries {
    pub id: CaptureTimestamp,
    pub base_shutter_us: u64,
    /// One path per level, in level order
    pub files: Vec<PathBuf>,
}

/// Capture a full bracket below `images_dir` using the layout of
/// [`naming::encode`]. The camera is reset afterwards whether or not the
/// bracket succeeded.
#[instrument(skip(driver, plan, images_dir), fields(series = %id))]
pub async fn capture_bracket(
    driver: &dyn CameraDriver,
    plan: &BracketPlan,
    images_dir: &Path,
    id: CaptureTimestamp,
) -> Result<CapturedSeries, CaptureError> {
    let mut session = CameraSession::open(driver, plan.iso, plan.metering_delay).await?;
    let base_shutter_us = session.metering().base_shutter_us;

    let captured = capture_levels(&mut session, plan, images_dir, id).await;
    let released = session.release().await;

    let files = captured?;
    if let Err(e) = released {
        warn!(error = %e, "Camera reset after bracket failed");
    }

    Ok(CapturedSeries {
        id,
        base_shutter_us,
        files,
    })
}

async fn capture_levels(
    session: &mut CameraSession<'_>,
    plan: &BracketPlan,
    images_dir: &Path,
    id: CaptureTimestamp,
) -> Result<Vec<PathBuf>, CaptureError> {
    let mut files = Vec::with_capacity(plan.levels.len());
    for (index, level) in plan.levels.iter().enumerate() {
        let path = images_dir.join(naming::encode(id, level));
        let shutter_us = session.capture_at(level, plan.settle_delay, &path).await?;

        info!(
            index,
            shutter_speed_percent = level.percent(),
            shutter_ms = shutter_us as f64 / 1000.0,
            file = %path.display(),
            "Captured"
        );
        files.push(path);
    }
    Ok(files)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::camera::{ExposureSettings, Metering};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use tokio::time::Instant;

    /// Camera double that writes tiny files and records what it was asked.
    #[derive(Default)]
    pub(crate) struct FakeCamera {
        pub base_shutter_us: u64,
        pub capture_duration: Duration,
        /// Zero-based meter calls that fail
        pub failing_meterings: HashSet<usize>,
        /// Zero-based capture calls that fail
        pub failing_captures: HashSet<usize>,
        pub meter_started: Mutex<Vec<Instant>>,
        pub exposures: Mutex<Vec<ExposureSettings>>,
        pub captures: Mutex<Vec<PathBuf>>,
        pub capture_calls: Mutex<usize>,
        pub resets: Mutex<usize>,
    }

    impl FakeCamera {
        pub(crate) fn new(base_shutter_us: u64) -> Self {
            Self {
                base_shutter_us,
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl CameraDriver for FakeCamera {
        async fn meter(&self, _iso: u32, settle: Duration) -> Result<Metering, CaptureError> {
            let call = {
                let mut started = self.meter_started.lock();
                started.push(Instant::now());
                started.len() - 1
            };
            tokio::time::sleep(settle).await;
            if self.failing_meterings.contains(&call) {
                return Err(CaptureError::Metadata("sensor timeout".to_string()));
            }
            Ok(Metering {
                base_shutter_us: self.base_shutter_us,
                awb_gains: (1.5, 1.25),
            })
        }

        async fn set_exposure(&self, settings: ExposureSettings) -> Result<(), CaptureError> {
            self.exposures.lock().push(settings);
            Ok(())
        }

        async fn capture(&self, path: &Path) -> Result<(), CaptureError> {
            let call = {
                let mut calls = self.capture_calls.lock();
                *calls += 1;
                *calls - 1
            };
            tokio::time::sleep(self.capture_duration).await;
            if self.failing_captures.contains(&call) {
                return Err(CaptureError::MissingOutput(path.to_path_buf()));
            }
            std::fs::write(path, b"jpeg").map_err(|source| CaptureError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            self.captures.lock().push(path.to_path_buf());
            Ok(())
        }

        async fn reset(&self) -> Result<(), CaptureError> {
            *self.resets.lock() += 1;
            Ok(())
        }
    }

    pub(crate) fn plan(percents: &[u32]) -> BracketPlan {
        BracketPlan {
            iso: 200,
            levels: ExposureLevels::new(percents).unwrap(),
            metering_delay: Duration::from_secs(5),
            settle_delay: Duration::from_secs(1),
        }
    }

    fn series() -> CaptureTimestamp {
        CaptureTimestamp::parse("2022-05-07T11-49-40").unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_bracket_scales_shutter_and_names_files() {
        let dir = tempfile::tempdir().unwrap();
        let camera = FakeCamera::new(10_000);

        let started = Instant::now();
        let captured = capture_bracket(&camera, &plan(&[20, 50, 100, 200, 500]), dir.path(), series())
            .await
            .unwrap();

        // 5s metering plus 1s settle per level
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(10) && elapsed < Duration::from_millis(10_100));

        let shutters: Vec<_> = camera.exposures.lock().iter().map(|e| e.shutter_us).collect();
        assert_eq!(shutters, vec![2_000, 5_000, 10_000, 20_000, 50_000]);
        assert!(camera.exposures.lock().iter().all(|e| e.iso == 200 && e.awb_gains == (1.5, 1.25)));

        assert_eq!(captured.base_shutter_us, 10_000);
        assert_eq!(captured.files.len(), 5);
        assert_eq!(
            captured.files[1],
            dir.path()
                .join("2022-05-07/2022-05-07T11-49-40/2022-05-07T11-49-40--shutter_050.jpg")
        );
        assert!(captured.files.iter().all(|f| f.exists()));
        assert_eq!(*camera.resets.lock(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_capture_still_resets_camera() {
        let dir = tempfile::tempdir().unwrap();
        let mut camera = FakeCamera::new(10_000);
        camera.failing_captures.insert(2);

        let result = capture_bracket(&camera, &plan(&[20, 50, 100, 200, 500]), dir.path(), series()).await;

        assert!(matches!(result, Err(CaptureError::MissingOutput(_))));
        assert_eq!(camera.captures.lock().len(), 2);
        assert_eq!(*camera.resets.lock(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_metering_resets_camera() {
        let dir = tempfile::tempdir().unwrap();
        let mut camera = FakeCamera::new(10_000);
        camera.failing_meterings.insert(0);

        let result = capture_bracket(&camera, &plan(&[50, 100]), dir.path(), series()).await;

        assert!(matches!(result, Err(CaptureError::Metadata(_))));
        assert!(camera.exposures.lock().is_empty());
        assert_eq!(*camera.resets.lock(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_exposure_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let camera = FakeCamera::new(0);

        let result = capture_bracket(&camera, &plan(&[50, 100]), dir.path(), series()).await;

        assert!(matches!(result, Err(CaptureError::NoExposure)));
        assert_eq!(*camera.resets.lock(), 1);
    }
}
