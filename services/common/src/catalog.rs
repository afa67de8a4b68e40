//! Exposure set builder and catalog reader.
//!
//! Scans the `{date}/{series}/{image}` hierarchy (or a flat list of blob keys),
//! decodes every still and groups them into one [`ExposureSet`] per capture
//! moment. Sets missing a level, or carrying a level outside the configured
//! bracket, are kept but flagged as partial.

use crate::config::CatalogConfig;
use crate::naming::{self, CaptureTimestamp, ExposureLevel, ExposureLevels, MalformedName};
use futures::stream::{self, StreamExt};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

/// Errors raised while building a catalog.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error(transparent)]
    MalformedName(#[from] MalformedName),

    #[error("series {series} contains shutter level {level} twice")]
    DuplicateExposure {
        series: CaptureTimestamp,
        level: ExposureLevel,
    },

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("catalog scan task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// One still of a bracket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedImage {
    pub timestamp: CaptureTimestamp,
    pub level: ExposureLevel,
    /// Local path or `/`-delimited blob key
    pub path: PathBuf,
}

/// All stills captured at one moment, keyed by exposure level.
#[derive(Debug, Clone)]
pub struct ExposureSet {
    id: CaptureTimestamp,
    images: BTreeMap<ExposureLevel, CapturedImage>,
    is_full: bool,
}

impl ExposureSet {
    /// Build a set from its images.
    ///
    /// Every image must carry `id` as its timestamp, and each level may appear
    /// once. The set is full when its levels equal `levels` exactly.
    pub fn build(
        id: CaptureTimestamp,
        images: impl IntoIterator<Item = CapturedImage>,
        levels: &ExposureLevels,
    ) -> Result<Self, CatalogError> {
        let mut by_level = BTreeMap::new();
        for image in images {
            if image.timestamp != id {
                return Err(MalformedName {
                    name: image.path.display().to_string(),
                    reason: format!("does not belong to series {}", id),
                }
                .into());
            }
            match by_level.entry(image.level) {
                Entry::Vacant(slot) => {
                    slot.insert(image);
                }
                Entry::Occupied(slot) => {
                    return Err(CatalogError::DuplicateExposure {
                        series: id,
                        level: *slot.key(),
                    });
                }
            }
        }

        let is_full = by_level.len() == levels.len()
            && by_level.keys().copied().eq(levels.iter());

        Ok(Self {
            id,
            images: by_level,
            is_full,
        })
    }

    pub fn id(&self) -> CaptureTimestamp {
        self.id
    }

    /// Series name, e.g. `2022-03-26T07-14-29`.
    pub fn name(&self) -> String {
        self.id.to_string()
    }

    pub fn is_full(&self) -> bool {
        self.is_full
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Images ordered by ascending exposure level.
    pub fn images(&self) -> impl Iterator<Item = &CapturedImage> {
        self.images.values()
    }

    pub fn image(&self, level: ExposureLevel) -> Option<&CapturedImage> {
        self.images.get(&level)
    }

    /// Paths ordered by ascending exposure level.
    pub fn image_paths(&self) -> Vec<&Path> {
        self.images.values().map(|i| i.path.as_path()).collect()
    }
}

/// Result of a scan, sets sorted by identifier.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    sets: Vec<ExposureSet>,
}

impl Catalog {
    fn from_unsorted(mut sets: Vec<ExposureSet>) -> Self {
        sets.sort_by_key(|s| s.id);
        Self { sets }
    }

    pub fn sets(&self) -> &[ExposureSet] {
        &self.sets
    }

    pub fn full_sets(&self) -> impl Iterator<Item = &ExposureSet> {
        self.sets.iter().filter(|s| s.is_full)
    }

    pub fn partial_sets(&self) -> impl Iterator<Item = &ExposureSet> {
        self.sets.iter().filter(|s| !s.is_full)
    }

    pub fn find(&self, id: CaptureTimestamp) -> Option<&ExposureSet> {
        self.sets
            .binary_search_by_key(&id, |s| s.id)
            .ok()
            .map(|i| &self.sets[i])
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    pub fn into_sets(self) -> Vec<ExposureSet> {
        self.sets
    }
}

/// How a scan treats malformed names and how wide it fans out.
#[derive(Debug, Clone, Copy)]
pub struct ScanOptions {
    /// Abort on a malformed `jpg` name instead of skipping it
    pub strict_names: bool,
    /// Series directories read concurrently
    pub workers: usize,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            strict_names: true,
            workers: 4,
        }
    }
}

impl From<&CatalogConfig> for ScanOptions {
    fn from(config: &CatalogConfig) -> Self {
        Self {
            strict_names: config.strict_names,
            workers: config.scan_workers,
        }
    }
}

/// Read every series below `images_dir` (`{date}/{series}/*.jpg`).
///
/// A missing root yields an empty catalog. Empty series directories are
/// ignored.
#[instrument(skip(levels), fields(root = %images_dir.display()))]
pub async fn read_catalog(
    images_dir: &Path,
    levels: &ExposureLevels,
    options: ScanOptions,
) -> Result<Catalog, CatalogError> {
    if !images_dir.exists() {
        debug!("Image directory does not exist, catalog is empty");
        return Ok(Catalog::default());
    }

    let root = images_dir.to_path_buf();
    let series_dirs = tokio::task::spawn_blocking(move || list_series_dirs(&root)).await??;

    let results: Vec<Result<Option<ExposureSet>, CatalogError>> = stream::iter(series_dirs)
        .map(|dir| {
            let levels = levels.clone();
            let strict = options.strict_names;
            async move {
                match tokio::task::spawn_blocking(move || read_series(&dir, &levels, strict)).await {
                    Ok(result) => result,
                    Err(e) => Err(CatalogError::from(e)),
                }
            }
        })
        .buffer_unordered(options.workers.max(1))
        .collect()
        .await;

    let mut sets = Vec::with_capacity(results.len());
    for result in results {
        if let Some(set) = result? {
            sets.push(set);
        }
    }

    let catalog = Catalog::from_unsorted(sets);
    info!(
        sets = catalog.len(),
        full = catalog.full_sets().count(),
        "Catalog scanned"
    );
    Ok(catalog)
}

/// Group a flat list of paths or blob keys into sets by decoded timestamp.
///
/// Only `jpg` entries are considered; the malformed-name policy is the same as
/// for [`read_catalog`].
pub fn group_images<I, P>(
    paths: I,
    levels: &ExposureLevels,
    strict_names: bool,
) -> Result<Catalog, CatalogError>
where
    I: IntoIterator<Item = P>,
    P: AsRef<Path>,
{
    let mut grouped: BTreeMap<CaptureTimestamp, Vec<CapturedImage>> = BTreeMap::new();

    for path in paths {
        let path = path.as_ref();
        let Some(file_name) = jpg_file_name(path) else {
            continue;
        };
        match naming::decode(file_name) {
            Ok(decoded) => grouped.entry(decoded.timestamp).or_default().push(CapturedImage {
                timestamp: decoded.timestamp,
                level: decoded.level,
                path: path.to_path_buf(),
            }),
            Err(e) => reject(strict_names, e)?,
        }
    }

    let sets = grouped
        .into_iter()
        .map(|(id, images)| ExposureSet::build(id, images, levels))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Catalog::from_unsorted(sets))
}

fn list_series_dirs(root: &Path) -> Result<Vec<PathBuf>, CatalogError> {
    let mut dirs = Vec::new();
    for entry in WalkDir::new(root)
        .min_depth(2)
        .max_depth(2)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|e| CatalogError::Io {
            path: e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf()),
            source: e.into(),
        })?;
        if entry.file_type().is_dir() {
            dirs.push(entry.into_path());
        }
    }
    Ok(dirs)
}

fn read_series(
    dir: &Path,
    levels: &ExposureLevels,
    strict: bool,
) -> Result<Option<ExposureSet>, CatalogError> {
    let dir_name = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let id = match CaptureTimestamp::parse(&dir_name) {
        Ok(id) => id,
        Err(e) => {
            reject(strict, e)?;
            return Ok(None);
        }
    };

    let io_err = |source: std::io::Error| CatalogError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        if entry.file_type().map_err(io_err)?.is_file() {
            paths.push(entry.path());
        }
    }
    paths.sort();

    let mut images = Vec::with_capacity(paths.len());
    for path in paths {
        let Some(file_name) = jpg_file_name(&path) else {
            continue;
        };
        let decoded = match naming::decode(file_name) {
            Ok(decoded) => decoded,
            Err(e) => {
                reject(strict, e)?;
                continue;
            }
        };
        if decoded.timestamp != id {
            reject(
                strict,
                MalformedName {
                    name: file_name.to_string(),
                    reason: format!("does not belong to series directory {}", id),
                },
            )?;
            continue;
        }
        images.push(CapturedImage {
            timestamp: id,
            level: decoded.level,
            path,
        });
    }

    if images.is_empty() {
        debug!(series = %id, "Series directory holds no images");
        return Ok(None);
    }

    ExposureSet::build(id, images, levels).map(Some)
}

fn jpg_file_name(path: &Path) -> Option<&str> {
    let file_name = path.file_name()?.to_str()?;
    let (_, extension) = file_name.rsplit_once('.')?;
    (extension == naming::IMAGE_EXTENSION).then_some(file_name)
}

fn reject(strict: bool, error: MalformedName) -> Result<(), CatalogError> {
    if strict {
        Err(error.into())
    } else {
        warn!(name = %error.name, reason = %error.reason, "Skipping malformed image name");
        Ok(())
    }
}
