//! Fixed-period capture loop.
//!
//! ```text
//!   start ──▶ Capturing ──(bracket + upload)──▶ Idle ──(interval - elapsed)──┐
//!                 ▲                                                          │
//!                 └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Cycles never overlap. A cycle that runs longer than the interval is
//! followed immediately by the next one, without catch-up.

use crate::bracket::{capture_bracket, BracketPlan};
use crate::camera::CameraDriver;
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use timelapse_common::{upload_pending, BlobStore, CaptureTimestamp};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Wait before the next bracket given how long the last one took.
pub fn next_wait(interval: Duration, elapsed: Duration) -> Duration {
    interval.saturating_sub(elapsed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Capturing,
}

/// Running totals of the capture loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub cycles: u64,
    pub captures: u64,
    pub capture_failures: u64,
    pub upload_failures: u64,
    pub last_series: Option<String>,
}

/// Register metric descriptions with the installed recorder.
pub fn describe_metrics() {
    metrics::describe_counter!("timelapse_cycles_total", "Capture cycles started");
    metrics::describe_counter!("timelapse_captures_total", "Brackets captured completely");
    metrics::describe_counter!(
        "timelapse_capture_failures_total",
        "Brackets aborted by a camera error"
    );
    metrics::describe_counter!(
        "timelapse_upload_failures_total",
        "Upload runs that stopped on an error"
    );
}

type SeriesClock = Box<dyn Fn() -> CaptureTimestamp + Send + Sync>;

/// Where captured files go after each bracket.
#[derive(Debug, Clone)]
pub struct UploadTarget {
    /// Local root of the `{date}/{series}` hierarchy
    pub images_dir: PathBuf,
    /// Blob prefix, `{timelapse_name}/images`
    pub remote_prefix: String,
    pub delete_after_upload: bool,
}

pub struct CaptureScheduler {
    camera: Arc<dyn CameraDriver>,
    store: Arc<dyn BlobStore>,
    plan: BracketPlan,
    interval: Duration,
    target: UploadTarget,
    clock: SeriesClock,
    state: RwLock<SchedulerState>,
    stats: RwLock<CaptureStats>,
}

impl CaptureScheduler {
    pub fn new(
        camera: Arc<dyn CameraDriver>,
        store: Arc<dyn BlobStore>,
        plan: BracketPlan,
        interval: Duration,
        target: UploadTarget,
    ) -> Self {
        Self {
            camera,
            store,
            plan,
            interval,
            target,
            clock: Box::new(CaptureTimestamp::now),
            state: RwLock::new(SchedulerState::Idle),
            stats: RwLock::new(CaptureStats::default()),
        }
    }

    /// Replace the source of series timestamps.
    pub fn with_clock(mut self, clock: impl Fn() -> CaptureTimestamp + Send + Sync + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.read()
    }

    pub fn stats(&self) -> CaptureStats {
        self.stats.read().clone()
    }

    /// Run cycles until `shutdown` turns true or `max_cycles` have run.
    ///
    /// Shutdown is honoured while idle; a running cycle always completes.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>, max_cycles: Option<u64>) -> CaptureStats {
        info!(
            interval_secs = self.interval.as_secs(),
            levels = self.plan.levels.len(),
            store = %self.store.describe(),
            "Capture loop started"
        );

        let mut cycles = 0u64;
        loop {
            if *shutdown.borrow() {
                break;
            }

            let started = Instant::now();
            self.run_cycle().await;
            cycles += 1;
            *self.state.write() = SchedulerState::Idle;

            if max_cycles.is_some_and(|max| cycles >= max) {
                break;
            }

            let deadline = started + self.interval.max(started.elapsed());
            let wait = next_wait(self.interval, started.elapsed());
            if wait.is_zero() {
                warn!(
                    elapsed_secs = started.elapsed().as_secs_f64(),
                    "Capture cycle overran the interval"
                );
            }

            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {}
                stopping = async { shutdown.wait_for(|stop| *stop).await.is_ok() } => {
                    if stopping {
                        break;
                    }
                    // Sender gone: no shutdown can arrive any more.
                    tokio::time::sleep_until(deadline).await;
                }
            }
        }

        info!("Capture loop stopped");
        self.stats()
    }

    async fn run_cycle(&self) {
        *self.state.write() = SchedulerState::Capturing;
        self.stats.write().cycles += 1;
        metrics::counter!("timelapse_cycles_total").increment(1);

        let id = (self.clock)();
        match capture_bracket(self.camera.as_ref(), &self.plan, &self.target.images_dir, id).await {
            Ok(series) => {
                {
                    let mut stats = self.stats.write();
                    stats.captures += 1;
                    stats.last_series = Some(series.id.to_string());
                }
                metrics::counter!("timelapse_captures_total").increment(1);
                info!(
                    series = %series.id,
                    files = series.files.len(),
                    base_shutter_us = series.base_shutter_us,
                    "Bracket captured"
                );
                self.upload().await;
            }
            Err(e) => {
                self.stats.write().capture_failures += 1;
                metrics::counter!("timelapse_capture_failures_total").increment(1);
                error!(series = %id, error = %e, "Bracket capture failed, skipping upload");
            }
        }
    }

    /// Push everything still on local disk. Failures are left for the next cycle.
    async fn upload(&self) {
        let result = upload_pending(
            self.store.as_ref(),
            &self.target.images_dir,
            &self.target.remote_prefix,
            self.target.delete_after_upload,
        )
        .await;

        if let Err(e) = result {
            self.stats.write().upload_failures += 1;
            metrics::counter!("timelapse_upload_failures_total").increment(1);
            warn!(error = %e, "Upload failed, will retry next cycle");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bracket::tests::{plan, FakeCamera};
    use async_trait::async_trait;
    use bytes::Bytes;
    use timelapse_common::{LocalBlobStore, TransferError};

    /// Store whose uploads always fail.
    struct FailingStore;

    #[async_trait]
    impl BlobStore for FailingStore {
        async fn upload(&self, key: &str, _data: Bytes) -> Result<(), TransferError> {
            Err(TransferError::Request {
                key: key.to_string(),
                message: "network unreachable".to_string(),
            })
        }

        async fn list(&self, _prefix: &str) -> Result<Vec<String>, TransferError> {
            Ok(Vec::new())
        }

        async fn download(&self, key: &str) -> Result<Bytes, TransferError> {
            Err(TransferError::NotFound {
                key: key.to_string(),
            })
        }

        async fn delete(&self, _key: &str) -> Result<(), TransferError> {
            Ok(())
        }

        fn describe(&self) -> String {
            "failing".to_string()
        }
    }

    /// Series timestamps that follow the (paused) tokio clock.
    fn paused_clock() -> impl Fn() -> CaptureTimestamp + Send + Sync + 'static {
        let origin = Instant::now();
        let base = CaptureTimestamp::parse("2022-03-26T10-00-00").unwrap().utc();
        move || {
            let offset = chrono::Duration::from_std(origin.elapsed()).unwrap();
            CaptureTimestamp::from_utc(base + offset)
        }
    }

    struct Harness {
        camera: Arc<FakeCamera>,
        scheduler: CaptureScheduler,
        local: tempfile::TempDir,
        remote: tempfile::TempDir,
    }

    fn harness(camera: FakeCamera, percents: &[u32], interval: Duration) -> Harness {
        harness_with_store(camera, percents, interval, None)
    }

    fn harness_with_store(
        camera: FakeCamera,
        percents: &[u32],
        interval: Duration,
        store: Option<Arc<dyn BlobStore>>,
    ) -> Harness {
        let local = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();
        let camera = Arc::new(camera);
        let store = store.unwrap_or_else(|| Arc::new(LocalBlobStore::new(remote.path())));
        let scheduler = CaptureScheduler::new(
            camera.clone(),
            store,
            plan(percents),
            interval,
            UploadTarget {
                images_dir: local.path().to_path_buf(),
                remote_prefix: "tl/images".to_string(),
                delete_after_upload: true,
            },
        )
        .with_clock(paused_clock());
        Harness {
            camera,
            scheduler,
            local,
            remote,
        }
    }

    fn gaps(starts: &[Instant]) -> Vec<Duration> {
        starts.windows(2).map(|w| w[1] - w[0]).collect()
    }

    fn assert_close(actual: Duration, expected: Duration) {
        let tolerance = Duration::from_millis(100);
        assert!(
            actual >= expected && actual < expected + tolerance,
            "expected {expected:?}, got {actual:?}"
        );
    }

    #[test]
    fn test_next_wait() {
        let interval = Duration::from_secs(600);
        assert_eq!(next_wait(interval, Duration::from_secs(10)), Duration::from_secs(590));
        assert_eq!(next_wait(interval, Duration::from_secs(600)), Duration::ZERO);
        assert_eq!(next_wait(interval, Duration::from_secs(900)), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycles_start_one_interval_apart() {
        let h = harness(FakeCamera::new(10_000), &[20, 50, 100, 200, 500], Duration::from_secs(600));
        let (_tx, rx) = watch::channel(false);

        let stats = h.scheduler.run(rx, Some(3)).await;

        let starts = h.camera.meter_started.lock().clone();
        assert_eq!(starts.len(), 3);
        for gap in gaps(&starts) {
            assert_close(gap, Duration::from_secs(600));
        }
        assert_eq!(stats.cycles, 3);
        assert_eq!(stats.captures, 3);
        assert_eq!(stats.capture_failures, 0);
        assert_eq!(h.scheduler.state(), SchedulerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overrunning_capture_starts_next_immediately() {
        let mut camera = FakeCamera::new(10_000);
        camera.capture_duration = Duration::from_secs(4);
        // 5s metering + 3 x (1s settle + 4s capture) = 20s > 10s interval
        let h = harness(camera, &[50, 100, 200], Duration::from_secs(10));
        let (_tx, rx) = watch::channel(false);

        h.scheduler.run(rx, Some(3)).await;

        let starts = h.camera.meter_started.lock().clone();
        for gap in gaps(&starts) {
            assert_close(gap, Duration::from_secs(20));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_failure_skips_upload_and_continues() {
        let mut camera = FakeCamera::new(10_000);
        camera.failing_meterings.insert(1);
        let h = harness(camera, &[50, 100], Duration::from_secs(60));
        let (_tx, rx) = watch::channel(false);

        let stats = h.scheduler.run(rx, Some(3)).await;

        assert_eq!(stats.cycles, 3);
        assert_eq!(stats.captures, 2);
        assert_eq!(stats.capture_failures, 1);
        assert_eq!(*h.camera.resets.lock(), 3);
        assert_eq!(stats.last_series.as_deref(), Some("2022-03-26T10-02-00"));

        let uploaded = std::fs::read_dir(h.remote.path().join("tl/images/2022-03-26"))
            .unwrap()
            .count();
        assert_eq!(uploaded, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_failure_keeps_files_for_next_cycle() {
        let h = harness_with_store(
            FakeCamera::new(10_000),
            &[50, 100],
            Duration::from_secs(60),
            Some(Arc::new(FailingStore)),
        );
        let (_tx, rx) = watch::channel(false);

        let stats = h.scheduler.run(rx, Some(2)).await;

        assert_eq!(stats.captures, 2);
        assert_eq!(stats.upload_failures, 2);
        let series_dirs = std::fs::read_dir(h.local.path().join("2022-03-26"))
            .unwrap()
            .count();
        assert_eq!(series_dirs, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_while_idle() {
        let h = Arc::new(harness(FakeCamera::new(10_000), &[50, 100], Duration::from_secs(600)));
        let (tx, rx) = watch::channel(false);

        let runner = {
            let h = h.clone();
            tokio::spawn(async move { h.scheduler.run(rx, None).await })
        };

        tokio::time::sleep(Duration::from_secs(30)).await;
        tx.send(true).unwrap();
        let stats = runner.await.unwrap();

        assert_eq!(stats.cycles, 1);
        assert_eq!(h.camera.meter_started.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_after_unrelated_update() {
        let h = Arc::new(harness(FakeCamera::new(10_000), &[50, 100], Duration::from_secs(600)));
        let (tx, rx) = watch::channel(false);
        let origin = Instant::now();

        let runner = {
            let h = h.clone();
            tokio::spawn(async move { h.scheduler.run(rx, None).await })
        };

        tokio::time::sleep(Duration::from_secs(30)).await;
        tx.send(false).unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        tx.send(true).unwrap();
        let stats = runner.await.unwrap();

        assert_eq!(stats.cycles, 1);
        assert!(origin.elapsed() < Duration::from_secs(600));
    }
}
