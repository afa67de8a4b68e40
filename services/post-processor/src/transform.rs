//! Per-set transforms that turn a bracket into a single frame.

use crate::tools::FrameTools;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use timelapse_common::{ExposureLevel, ExposureLevels, ExposureSet, ExternalToolError};

const HDR_PREFIX: &str = "hdr_";
const CENTER_BRACKET: &str = "center_bracket";

#[derive(Error, Debug)]
pub enum TransformError {
    #[error(transparent)]
    Tool(#[from] ExternalToolError),

    #[error("set has no image at exposure level {0}")]
    MissingLevel(ExposureLevel),

    #[error("tool reported success but wrote no output at {}", .0.display())]
    NoOutput(PathBuf),

    #[error("unknown transform {0:?}, expected center_bracket or hdr_<method>")]
    Unknown(String),
}

/// A named way of reducing an exposure set to one frame. The name is used as
/// the output directory and video file name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Transform {
    /// Tone-mapped HDR merge of the whole bracket, e.g. `hdr_drago`
    HdrMerge { method: String },
    /// The image at the middle configured level, unchanged
    CenterBracket,
}

impl Transform {
    pub fn hdr(method: impl Into<String>) -> Self {
        Self::HdrMerge {
            method: method.into(),
        }
    }

    pub fn name(&self) -> String {
        match self {
            Self::HdrMerge { method } => format!("{HDR_PREFIX}{method}"),
            Self::CenterBracket => CENTER_BRACKET.to_string(),
        }
    }

    /// Parse a list of configured transform names.
    pub fn parse_all<S: AsRef<str>>(names: &[S]) -> Result<Vec<Self>, TransformError> {
        names.iter().map(|n| n.as_ref().parse()).collect()
    }

    /// Produce the untitled frame for `set` and return its path.
    ///
    /// HDR merges are written to `scratch`; the centre bracket is the
    /// captured file itself.
    pub async fn apply(
        &self,
        set: &ExposureSet,
        levels: &ExposureLevels,
        tools: &dyn FrameTools,
        scratch: &Path,
    ) -> Result<PathBuf, TransformError> {
        match self {
            Self::HdrMerge { method } => {
                let inputs: Vec<PathBuf> =
                    set.image_paths().into_iter().map(Path::to_path_buf).collect();
                tools.hdr_merge(method, &inputs, scratch).await?;
                if !tokio::fs::try_exists(scratch).await.unwrap_or(false) {
                    return Err(TransformError::NoOutput(scratch.to_path_buf()));
                }
                Ok(scratch.to_path_buf())
            }
            Self::CenterBracket => {
                let level = levels.median();
                set.image(level)
                    .map(|image| image.path.clone())
                    .ok_or(TransformError::MissingLevel(level))
            }
        }
    }
}

impl fmt::Display for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl FromStr for Transform {
    type Err = TransformError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == CENTER_BRACKET {
            return Ok(Self::CenterBracket);
        }
        match s.strip_prefix(HDR_PREFIX) {
            Some(method) if !method.is_empty() => Ok(Self::hdr(method)),
            _ => Err(TransformError::Unknown(s.to_string())),
        }
    }
}
