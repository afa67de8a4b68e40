//! Assemble processed frames into one video per transform.

use crate::driver::ProcessingError;
use crate::tools::FrameTools;
use std::path::{Path, PathBuf};
use tracing::{info, instrument, warn};

const FRAME_PATTERN: &str = "frame_%06d.bmp";

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ProcessingError + '_ {
    move |source| ProcessingError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Every frame must match the first frame's size.
pub async fn check_dimensions(frames: &[PathBuf]) -> Result<(u32, u32), ProcessingError> {
    let frames = frames.to_vec();
    tokio::task::spawn_blocking(move || -> Result<(u32, u32), ProcessingError> {
        let mut expected = None;
        for path in frames {
            let actual = image::image_dimensions(&path).map_err(|source| {
                ProcessingError::Image {
                    path: path.clone(),
                    source,
                }
            })?;
            match expected {
                None => expected = Some(actual),
                Some(expected) if expected != actual => {
                    return Err(ProcessingError::DimensionMismatch {
                        path,
                        expected,
                        actual,
                    });
                }
                Some(_) => {}
            }
        }
        expected.ok_or(ProcessingError::NoFrames)
    })
    .await?
}

/// Encode `frames`, in the given order, into `output` at `frame_rate`.
///
/// Frames are checked before anything is written; a failed encode leaves any
/// previous video in place.
#[instrument(skip(tools, frames), fields(frames = frames.len(), output = %output.display()))]
pub async fn assemble_video(
    tools: &dyn FrameTools,
    frames: &[PathBuf],
    frame_rate: u32,
    output: &Path,
) -> Result<(), ProcessingError> {
    if frames.is_empty() {
        return Err(ProcessingError::NoFrames);
    }
    let (width, height) = check_dimensions(frames).await?;

    let staging = output.with_extension("frames");
    if tokio::fs::try_exists(&staging).await.unwrap_or(false) {
        tokio::fs::remove_dir_all(&staging)
            .await
            .map_err(io_error(&staging))?;
    }
    tokio::fs::create_dir_all(&staging)
        .await
        .map_err(io_error(&staging))?;

    for (index, frame) in frames.iter().enumerate() {
        let staged = staging.join(format!("frame_{index:06}.bmp"));
        if tokio::fs::hard_link(frame, &staged).await.is_err() {
            tokio::fs::copy(frame, &staged)
                .await
                .map_err(io_error(frame))?;
        }
    }

    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let partial = output.with_file_name(format!("{stem}.partial.mp4"));

    let encoded = tools
        .encode_video(&staging.join(FRAME_PATTERN), frame_rate, &partial)
        .await;
    if let Err(e) = tokio::fs::remove_dir_all(&staging).await {
        warn!(error = %e, staging = %staging.display(), "Failed to remove staged frames");
    }
    encoded?;

    tokio::fs::rename(&partial, output)
        .await
        .map_err(io_error(output))?;

    info!(width, height, frame_rate, "Video written");
    Ok(())
}
