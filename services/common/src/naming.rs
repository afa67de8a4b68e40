//! Naming codec for captured images.
//!
//! Every image carries its own grouping information in its name:
//!
//! ```text
//! {date}/{series}/{series}--shutter_{NNN}.jpg
//! 2022-05-07/2022-05-07T11-49-40/2022-05-07T11-49-40--shutter_100.jpg
//! ```
//!
//! `series` is the capture timestamp of the whole bracket rendered with the
//! colons replaced by hyphens so it is safe as a file name and blob key, and
//! `date` is its UTC calendar date. The same relative layout is used below
//! `{timelapse_name}/images` both on the local disk and in the blob store.

use chrono::{DateTime, NaiveDateTime, SubsecRound, TimeZone, Utc};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Rendering of a capture timestamp, e.g. `2022-03-26T07-14-29`.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H-%M-%S";

/// Rendering of the UTC date bucket, e.g. `2022-03-26`.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Extension of captured stills.
pub const IMAGE_EXTENSION: &str = "jpg";

/// File name of a processed frame inside its `{series}/{transform}` directory.
pub const PROCESSED_FRAME_NAME: &str = "img.bmp";

const SHUTTER_MARKER: &str = "--shutter_";

/// A name that does not follow the `<timestamp>--shutter_<digits>.<ext>` pattern.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed image name {name:?}: {reason}")]
pub struct MalformedName {
    pub name: String,
    pub reason: String,
}

impl MalformedName {
    fn new(name: &str, reason: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

/// UTC capture instant of an exposure set, truncated to whole seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CaptureTimestamp(DateTime<Utc>);

impl CaptureTimestamp {
    /// Current time, truncated to the second.
    pub fn now() -> Self {
        Self::from_utc(Utc::now())
    }

    pub fn from_utc(instant: DateTime<Utc>) -> Self {
        Self(instant.trunc_subsecs(0))
    }

    /// Build from calendar fields, mostly useful in tests and tools.
    pub fn from_ymd_hms(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> Option<Self> {
        Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
            .single()
            .map(Self)
    }

    pub fn utc(&self) -> DateTime<Utc> {
        self.0
    }

    /// UTC calendar date used as the first directory level.
    pub fn date_str(&self) -> String {
        self.0.format(DATE_FORMAT).to_string()
    }

    /// Parse a series identifier. Only the canonical rendering is accepted so
    /// that parse and render stay a lossless round trip.
    pub fn parse(s: &str) -> Result<Self, MalformedName> {
        let naive = NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT)
            .map_err(|e| MalformedName::new(s, format!("invalid timestamp: {}", e)))?;
        let timestamp = Self(naive.and_utc());
        if timestamp.to_string() != s {
            return Err(MalformedName::new(s, "timestamp is not in canonical form"));
        }
        Ok(timestamp)
    }
}

impl fmt::Display for CaptureTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(TIMESTAMP_FORMAT))
    }
}

impl FromStr for CaptureTimestamp {
    type Err = MalformedName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Shutter speed as a percentage of the metered base exposure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExposureLevel(u32);

impl ExposureLevel {
    pub const fn new(percent: u32) -> Self {
        Self(percent)
    }

    pub fn percent(&self) -> u32 {
        self.0
    }

    /// Shutter time for this level given the metered base shutter time.
    pub fn scale_shutter_us(&self, base_us: u64) -> u64 {
        (self.0 as f64 / 100.0 * base_us as f64).round() as u64
    }
}

impl fmt::Display for ExposureLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}", self.0)
    }
}

/// Invalid exposure level list.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExposureLevelsError {
    #[error("exposure level list is empty")]
    Empty,

    #[error("exposure levels must be strictly ascending, got {0:?}")]
    NotAscending(Vec<u32>),

    #[error("exposure level must be greater than 0")]
    Zero,
}

/// The deployment's fixed, ordered bracket. Its length is the size of a full set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExposureLevels(Vec<ExposureLevel>);

impl ExposureLevels {
    pub fn new(percents: &[u32]) -> Result<Self, ExposureLevelsError> {
        if percents.is_empty() {
            return Err(ExposureLevelsError::Empty);
        }
        if percents.contains(&0) {
            return Err(ExposureLevelsError::Zero);
        }
        if percents.windows(2).any(|w| w[0] >= w[1]) {
            return Err(ExposureLevelsError::NotAscending(percents.to_vec()));
        }
        Ok(Self(percents.iter().copied().map(ExposureLevel).collect()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = ExposureLevel> + '_ {
        self.0.iter().copied()
    }

    pub fn contains(&self, level: ExposureLevel) -> bool {
        self.0.contains(&level)
    }

    pub fn as_slice(&self) -> &[ExposureLevel] {
        &self.0
    }

    /// Centre of the bracket.
    pub fn median(&self) -> ExposureLevel {
        self.0[self.0.len() / 2]
    }
}

/// Result of decoding an image file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedName {
    pub timestamp: CaptureTimestamp,
    pub level: ExposureLevel,
    pub extension: String,
}

/// File name of one image of a bracket.
pub fn image_file_name(timestamp: CaptureTimestamp, level: ExposureLevel) -> String {
    format!("{timestamp}{SHUTTER_MARKER}{level}.{IMAGE_EXTENSION}")
}

/// Relative directory of a series: `{date}/{series}`.
pub fn series_dir(timestamp: CaptureTimestamp) -> String {
    format!("{}/{}", timestamp.date_str(), timestamp)
}

/// Relative, `/`-delimited path of one image: `{date}/{series}/{file}`.
pub fn encode(timestamp: CaptureTimestamp, level: ExposureLevel) -> String {
    format!(
        "{}/{}",
        series_dir(timestamp),
        image_file_name(timestamp, level)
    )
}

/// Decode a bare file name (no directories).
pub fn decode(file_name: &str) -> Result<DecodedName, MalformedName> {
    let (stem, extension) = file_name
        .rsplit_once('.')
        .ok_or_else(|| MalformedName::new(file_name, "missing extension"))?;
    if extension.is_empty() {
        return Err(MalformedName::new(file_name, "missing extension"));
    }

    let (timestamp, digits) = stem
        .split_once(SHUTTER_MARKER)
        .ok_or_else(|| MalformedName::new(file_name, "missing --shutter_ marker"))?;

    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(MalformedName::new(file_name, "shutter value is not a number"));
    }
    let percent: u32 = digits
        .parse()
        .map_err(|_| MalformedName::new(file_name, "shutter value out of range"))?;

    let timestamp = CaptureTimestamp::parse(timestamp)
        .map_err(|e| MalformedName::new(file_name, e.reason))?;

    Ok(DecodedName {
        timestamp,
        level: ExposureLevel(percent),
        extension: extension.to_string(),
    })
}

/// Decode the last component of a local path or `/`-delimited blob key.
pub fn decode_key(key: &str) -> Result<DecodedName, MalformedName> {
    decode(key.rsplit('/').next().unwrap_or(key))
}

/// Blob prefix (and local sub-directory) holding raw captures.
pub fn images_prefix(timelapse_name: &str) -> String {
    format!("{timelapse_name}/images")
}

/// Local sub-directory holding processed frames and videos.
pub fn processed_prefix(timelapse_name: &str) -> String {
    format!("{timelapse_name}/processed")
}

/// `processed/{day}/{series}/{transform}/img.bmp`
pub fn processed_frame_path(processed_dir: &Path, set_id: CaptureTimestamp, transform: &str) -> PathBuf {
    processed_dir
        .join(set_id.date_str())
        .join(set_id.to_string())
        .join(transform)
        .join(PROCESSED_FRAME_NAME)
}

/// `processed/{transform}.mp4`
pub fn video_path(processed_dir: &Path, transform: &str) -> PathBuf {
    processed_dir.join(format!("{transform}.mp4"))
}
