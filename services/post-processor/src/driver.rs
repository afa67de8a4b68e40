//! Post-processing driver: selected sets -> titled frames -> videos.

use crate::tools::FrameTools;
use crate::transform::{Transform, TransformError};
use crate::video;
use futures::stream::{self, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use timelapse_common::naming::{self, CaptureTimestamp};
use timelapse_common::{
    Catalog, CatalogError, DailySelector, ExposureLevels, ExposureSet, ExternalToolError,
};
use tokio::task::JoinError;
use tracing::{debug, info, instrument};

/// Local time as rendered on frames, e.g. `2022-03-26 13:30:00+03:00`.
const OVERLAY_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%:z";

#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error("{transform} failed for set {set}: {source}")]
    Transform {
        set: String,
        transform: String,
        source: TransformError,
    },

    #[error(
        "frame {} is {}x{}, expected {}x{} like the first frame",
        path.display(), actual.0, actual.1, expected.0, expected.1
    )]
    DimensionMismatch {
        path: PathBuf,
        expected: (u32, u32),
        actual: (u32, u32),
    },

    #[error("no frames to assemble")]
    NoFrames,

    #[error("cannot read image {}: {source}", path.display())]
    Image {
        path: PathBuf,
        source: image::ImageError,
    },

    #[error("video encoding failed: {0}")]
    Encode(#[from] ExternalToolError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("worker task failed: {0}")]
    Join(#[from] JoinError),
}

/// What happened to one (set, transform) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Created,
    Skipped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameSummary {
    pub created: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub sets: usize,
    pub frames: FrameSummary,
    pub videos: Vec<PathBuf>,
}

/// Which sets become frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    /// One representative per local day
    Daily,
    /// Every full set
    EverySet,
}

pub struct PostProcessor {
    tools: Arc<dyn FrameTools>,
    selector: DailySelector,
    levels: ExposureLevels,
    transforms: Vec<Transform>,
    processed_dir: PathBuf,
    workers: usize,
    frame_rate: u32,
    overwrite: bool,
}

impl PostProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tools: Arc<dyn FrameTools>,
        selector: DailySelector,
        levels: ExposureLevels,
        transforms: Vec<Transform>,
        processed_dir: PathBuf,
        workers: usize,
        frame_rate: u32,
        overwrite: bool,
    ) -> Self {
        Self {
            tools,
            selector,
            levels,
            transforms,
            processed_dir,
            workers: workers.max(1),
            frame_rate,
            overwrite,
        }
    }

    pub fn processed_dir(&self) -> &Path {
        &self.processed_dir
    }

    /// Caption drawn on a frame: series name and its local capture time.
    pub fn overlay_text(&self, id: CaptureTimestamp) -> String {
        let local = self.selector.local_time(id);
        format!("{}     {}", id, local.format(OVERLAY_TIME_FORMAT))
    }

    pub fn frame_path(&self, id: CaptureTimestamp, transform: &Transform) -> PathBuf {
        naming::processed_frame_path(&self.processed_dir, id, &transform.name())
    }

    pub fn select<'a>(&self, catalog: &'a Catalog, selection: Selection) -> Vec<&'a ExposureSet> {
        match selection {
            Selection::Daily => self.selector.select(catalog.sets()),
            Selection::EverySet => catalog.full_sets().collect(),
        }
    }

    /// Produce the titled frame of `set` under `transform`.
    ///
    /// An existing frame is kept unless overwriting. The frame only appears
    /// at its final path once fully written.
    #[instrument(skip(self, set, transform), fields(set = %set.id(), transform = %transform))]
    pub async fn process_set(
        &self,
        set: &ExposureSet,
        transform: &Transform,
    ) -> Result<FrameOutcome, ProcessingError> {
        let output = self.frame_path(set.id(), transform);
        if !self.overwrite && tokio::fs::try_exists(&output).await.unwrap_or(false) {
            debug!("Frame exists, skipping");
            return Ok(FrameOutcome::Skipped);
        }

        let dir = output
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.processed_dir.clone());
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| ProcessingError::Io {
                path: dir.clone(),
                source,
            })?;

        let wrap = |source: TransformError| ProcessingError::Transform {
            set: set.name(),
            transform: transform.name(),
            source,
        };

        let scratch = dir.join("merged.partial.bmp");
        let partial = dir.join("img.partial.bmp");
        match tokio::fs::remove_file(&scratch).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                return Err(ProcessingError::Io {
                    path: scratch,
                    source: e,
                });
            }
            _ => {}
        }

        let untitled = transform
            .apply(set, &self.levels, self.tools.as_ref(), &scratch)
            .await
            .map_err(&wrap)?;
        let titled = self
            .tools
            .overlay_text(&untitled, &self.overlay_text(set.id()), &partial)
            .await;
        if untitled == scratch {
            let _ = tokio::fs::remove_file(&scratch).await;
        }
        titled.map_err(|e| wrap(e.into()))?;

        tokio::fs::rename(&partial, &output)
            .await
            .map_err(|source| ProcessingError::Io {
                path: output.clone(),
                source,
            })?;

        debug!(output = %output.display(), "Frame written");
        Ok(FrameOutcome::Created)
    }

    /// Every configured transform over every set, `workers` at a time.
    /// The first failure stops the run.
    pub async fn process_all(&self, sets: &[&ExposureSet]) -> Result<FrameSummary, ProcessingError> {
        let jobs: Vec<(&ExposureSet, &Transform)> = self
            .transforms
            .iter()
            .flat_map(|t| sets.iter().map(move |s| (*s, t)))
            .collect();

        let mut results = stream::iter(jobs)
            .map(|(set, transform)| self.process_set(set, transform))
            .buffer_unordered(self.workers);

        let mut summary = FrameSummary::default();
        while let Some(result) = results.next().await {
            match result? {
                FrameOutcome::Created => summary.created += 1,
                FrameOutcome::Skipped => summary.skipped += 1,
            }
        }
        Ok(summary)
    }

    /// One video per transform from the frames of `sets`, in set order.
    /// All frames are checked before any video is written.
    pub async fn assemble_videos(&self, sets: &[&ExposureSet]) -> Result<Vec<PathBuf>, ProcessingError> {
        let mut ordered: Vec<CaptureTimestamp> = sets.iter().map(|s| s.id()).collect();
        ordered.sort();

        let plans: Vec<(PathBuf, Vec<PathBuf>)> = self
            .transforms
            .iter()
            .map(|transform| {
                let frames = ordered
                    .iter()
                    .map(|id| self.frame_path(*id, transform))
                    .collect();
                (naming::video_path(&self.processed_dir, &transform.name()), frames)
            })
            .collect();

        for (_, frames) in &plans {
            video::check_dimensions(frames).await?;
        }

        let mut videos = Vec::with_capacity(plans.len());
        for (output, frames) in plans {
            video::assemble_video(self.tools.as_ref(), &frames, self.frame_rate, &output).await?;
            videos.push(output);
        }
        Ok(videos)
    }

    /// Select, process and assemble.
    pub async fn run(&self, catalog: &Catalog, selection: Selection) -> Result<RunSummary, ProcessingError> {
        let sets = self.select(catalog, selection);
        info!(
            sets = sets.len(),
            transforms = self.transforms.len(),
            ?selection,
            "Processing sets"
        );
        if sets.is_empty() {
            return Ok(RunSummary::default());
        }

        let frames = self.process_all(&sets).await?;
        info!(created = frames.created, skipped = frames.skipped, "Frames ready");

        let videos = self.assemble_videos(&sets).await?;
        Ok(RunSummary {
            sets: sets.len(),
            frames,
            videos,
        })
    }
}
