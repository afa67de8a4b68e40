//! Moving the image hierarchy between a local directory and the blob store.
//!
//! The recorder pushes everything it has locally and deletes each file only
//! after its own upload succeeded, so a failed upload is simply retried on the
//! next cycle. The post-processor pulls whatever it does not have yet.

use crate::blob_store::{BlobStore, TransferError};
use crate::config::TimelapseConfig;
use bytes::Bytes;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

const PARTIAL_SUFFIX: &str = ".partial";

/// Outcome of [`upload_pending`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadReport {
    pub uploaded: usize,
    pub bytes: u64,
}

/// What [`download_missing`] should fetch.
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    /// Only keys whose path below the remote prefix starts with this, e.g. `2022-03`
    pub day_prefix: Option<String>,
    /// Remove local files (within the day prefix) that no longer exist remotely
    pub delete_extraneous: bool,
    /// Concurrent downloads
    pub concurrency: usize,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            day_prefix: None,
            delete_extraneous: false,
            concurrency: 4,
        }
    }
}

impl DownloadOptions {
    /// Every day, with the configured deletion policy and concurrency.
    pub fn from_config(config: &TimelapseConfig) -> Self {
        Self {
            day_prefix: None,
            delete_extraneous: config.sync.delete_extraneous,
            concurrency: config.storage.transfer_concurrency,
        }
    }
}

/// Outcome of [`download_missing`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadReport {
    pub listed: usize,
    pub downloaded: usize,
    pub skipped: usize,
    pub deleted: usize,
}

fn io_error(path: &Path, source: std::io::Error) -> TransferError {
    TransferError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn relative_key(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Files below `root`, as (absolute path, `/`-joined relative key), sorted.
async fn local_files(root: &Path) -> Result<Vec<(PathBuf, String)>, TransferError> {
    let root = root.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<Vec<(PathBuf, String)>, TransferError> {
        let mut files = Vec::new();
        if !root.exists() {
            return Ok(files);
        }
        for entry in WalkDir::new(&root).min_depth(1).sort_by_file_name() {
            let entry = entry.map_err(|e| TransferError::Io {
                path: e.path().map(Path::to_path_buf).unwrap_or_else(|| root.clone()),
                source: e.into(),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            if let Ok(relative) = entry.path().strip_prefix(&root) {
                let key = relative_key(relative);
                files.push((entry.into_path(), key));
            }
        }
        Ok(files)
    })
    .await?
}

/// Remove now-empty directories between `path` and `root`, `root` excluded.
async fn prune_empty_parents(root: &Path, path: &Path) {
    let mut current = path.parent();
    while let Some(dir) = current {
        if dir == root || !dir.starts_with(root) {
            break;
        }
        // Fails when the directory still has entries, which ends the walk.
        if tokio::fs::remove_dir(dir).await.is_err() {
            break;
        }
        current = dir.parent();
    }
}

/// Upload every file below `local_dir` to `{dest_prefix}/{relative path}`.
///
/// Files go up in sorted (chronological) order. With `delete_after_upload` a
/// file is removed right after its own upload succeeded. The first failure
/// stops the run and is returned; everything not yet sent stays on disk.
#[instrument(skip(store), fields(store = %store.describe(), local_dir = %local_dir.display()))]
pub async fn upload_pending(
    store: &dyn BlobStore,
    local_dir: &Path,
    dest_prefix: &str,
    delete_after_upload: bool,
) -> Result<UploadReport, TransferError> {
    let files = local_files(local_dir).await?;
    let mut report = UploadReport::default();

    for (path, relative) in files {
        if relative.ends_with(PARTIAL_SUFFIX) {
            continue;
        }
        let key = format!("{}/{}", dest_prefix.trim_end_matches('/'), relative);

        let data = tokio::fs::read(&path)
            .await
            .map_err(|e| io_error(&path, e))?;
        let size = data.len() as u64;

        store.upload(&key, Bytes::from(data)).await?;
        report.uploaded += 1;
        report.bytes += size;
        debug!(key = %key, size_bytes = size, "Uploaded");

        if delete_after_upload {
            tokio::fs::remove_file(&path)
                .await
                .map_err(|e| io_error(&path, e))?;
            prune_empty_parents(local_dir, &path).await;
        }
    }

    if report.uploaded > 0 {
        info!(
            uploaded = report.uploaded,
            bytes = report.bytes,
            "Upload complete"
        );
    }
    Ok(report)
}

/// Download every blob below `remote_prefix` that is missing in `local_dir`.
///
/// Files already present locally are never re-downloaded. Each download is
/// written next to its target and renamed into place.
#[instrument(skip(store, options), fields(store = %store.describe(), local_dir = %local_dir.display()))]
pub async fn download_missing(
    store: &dyn BlobStore,
    remote_prefix: &str,
    local_dir: &Path,
    options: &DownloadOptions,
) -> Result<DownloadReport, TransferError> {
    let remote_prefix = remote_prefix.trim_end_matches('/');
    let day_prefix = options.day_prefix.as_deref().unwrap_or("");
    let list_prefix = format!("{}/{}", remote_prefix, day_prefix);

    let keys = store.list(&list_prefix).await?;
    let mut report = DownloadReport {
        listed: keys.len(),
        ..DownloadReport::default()
    };

    let mut remote = HashSet::with_capacity(keys.len());
    let mut missing = Vec::new();
    for key in &keys {
        let Some(relative) = key.strip_prefix(remote_prefix).map(|r| r.trim_start_matches('/')) else {
            continue;
        };
        let relative_path = Path::new(relative);
        if relative.is_empty()
            || !relative_path
                .components()
                .all(|c| matches!(c, Component::Normal(_)))
        {
            warn!(key = %key, "Skipping blob with unusable key");
            continue;
        }
        remote.insert(relative.to_string());

        let target = local_dir.join(relative_path);
        if tokio::fs::try_exists(&target).await.unwrap_or(false) {
            report.skipped += 1;
        } else {
            missing.push((key.clone(), target));
        }
    }

    report.downloaded = stream::iter(missing)
        .map(|(key, target)| async move { fetch(store, &key, &target).await })
        .buffer_unordered(options.concurrency.max(1))
        .try_fold(0usize, |count, ()| async move { Ok(count + 1) })
        .await?;

    if options.delete_extraneous {
        for (path, relative) in local_files(local_dir).await? {
            if relative.starts_with(day_prefix) && !remote.contains(&relative) {
                tokio::fs::remove_file(&path)
                    .await
                    .map_err(|e| io_error(&path, e))?;
                prune_empty_parents(local_dir, &path).await;
                report.deleted += 1;
            }
        }
    }

    info!(
        listed = report.listed,
        downloaded = report.downloaded,
        skipped = report.skipped,
        deleted = report.deleted,
        "Download sync complete"
    );
    Ok(report)
}

async fn fetch(store: &dyn BlobStore, key: &str, target: &Path) -> Result<(), TransferError> {
    let data = store.download(key).await?;

    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| io_error(parent, e))?;
    }
    let mut partial = target.as_os_str().to_owned();
    partial.push(PARTIAL_SUFFIX);
    let partial = PathBuf::from(partial);

    tokio::fs::write(&partial, &data)
        .await
        .map_err(|e| io_error(&partial, e))?;
    tokio::fs::rename(&partial, target)
        .await
        .map_err(|e| io_error(target, e))?;

    debug!(key = %key, "Downloaded");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::{LocalBlobStore, MockBlobStore};

    fn write(root: &Path, relative: &str, content: &[u8]) {
        let path = root.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    const A: &str = "2022-03-26/2022-03-26T10-30-00/2022-03-26T10-30-00--shutter_020.jpg";
    const B: &str = "2022-03-26/2022-03-26T10-30-00/2022-03-26T10-30-00--shutter_050.jpg";
    const C: &str = "2022-03-26/2022-03-26T10-40-00/2022-03-26T10-40-00--shutter_020.jpg";

    #[tokio::test]
    async fn test_upload_deletes_after_success() {
        let local = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();
        write(local.path(), A, b"a");
        write(local.path(), B, b"bb");
        write(local.path(), C, b"ccc");

        let store = LocalBlobStore::new(remote.path());
        let report = upload_pending(&store, local.path(), "tl/images", true)
            .await
            .unwrap();

        assert_eq!(report, UploadReport { uploaded: 3, bytes: 6 });
        assert_eq!(
            store.list("tl/images/").await.unwrap(),
            vec![
                format!("tl/images/{A}"),
                format!("tl/images/{B}"),
                format!("tl/images/{C}"),
            ]
        );
        // local root survives, everything below it is gone
        assert!(local.path().exists());
        assert_eq!(std::fs::read_dir(local.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_upload_keeps_files_when_asked() {
        let local = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();
        write(local.path(), A, b"a");

        let store = LocalBlobStore::new(remote.path());
        upload_pending(&store, local.path(), "tl/images/", false)
            .await
            .unwrap();

        assert!(local.path().join(A).exists());
        assert_eq!(store.list("").await.unwrap(), vec![format!("tl/images/{A}")]);
    }

    #[tokio::test]
    async fn test_upload_failure_keeps_unsent_files() {
        let local = tempfile::tempdir().unwrap();
        write(local.path(), A, b"a");
        write(local.path(), B, b"b");
        write(local.path(), C, b"c");

        let mut store = MockBlobStore::new();
        store.expect_describe().return_const("mock".to_string());
        store
            .expect_upload()
            .withf(|key, _| key.ends_with("T10-30-00--shutter_020.jpg"))
            .times(1)
            .returning(|_, _| Ok(()));
        store
            .expect_upload()
            .withf(|key, _| key.ends_with("T10-30-00--shutter_050.jpg"))
            .times(1)
            .returning(|key, _| {
                Err(TransferError::Request {
                    key: key.to_string(),
                    message: "connection reset".to_string(),
                })
            });

        let result = upload_pending(&store, local.path(), "tl/images", true).await;

        assert!(matches!(result, Err(TransferError::Request { .. })));
        assert!(!local.path().join(A).exists());
        assert!(local.path().join(B).exists());
        assert!(local.path().join(C).exists());
    }

    #[tokio::test]
    async fn test_upload_of_missing_dir_is_noop() {
        let local = tempfile::tempdir().unwrap();
        let mut store = MockBlobStore::new();
        store.expect_describe().return_const("mock".to_string());

        let report = upload_pending(&store, &local.path().join("absent"), "tl/images", true)
            .await
            .unwrap();
        assert_eq!(report, UploadReport::default());
    }

    #[tokio::test]
    async fn test_download_skips_present_files() {
        let remote = tempfile::tempdir().unwrap();
        let local = tempfile::tempdir().unwrap();
        write(remote.path(), &format!("tl/images/{A}"), b"remote-a");
        write(remote.path(), &format!("tl/images/{B}"), b"remote-b");
        write(local.path(), A, b"local-a");

        let store = LocalBlobStore::new(remote.path());
        let report = download_missing(&store, "tl/images", local.path(), &DownloadOptions::default())
            .await
            .unwrap();

        assert_eq!(
            report,
            DownloadReport {
                listed: 2,
                downloaded: 1,
                skipped: 1,
                deleted: 0
            }
        );
        assert_eq!(std::fs::read(local.path().join(A)).unwrap(), b"local-a");
        assert_eq!(std::fs::read(local.path().join(B)).unwrap(), b"remote-b");
    }

    #[tokio::test]
    async fn test_download_day_prefix_and_delete_extraneous() {
        let remote = tempfile::tempdir().unwrap();
        let local = tempfile::tempdir().unwrap();
        write(remote.path(), &format!("tl/images/{A}"), b"a");
        write(remote.path(), "tl/images/2022-03-27/2022-03-27T10-00-00/2022-03-27T10-00-00--shutter_020.jpg", b"x");
        write(local.path(), C, b"stale");
        write(local.path(), "2022-03-25/old/old.jpg", b"outside the day prefix");

        let store = LocalBlobStore::new(remote.path());
        let options = DownloadOptions {
            day_prefix: Some("2022-03-26".to_string()),
            delete_extraneous: true,
            concurrency: 2,
        };
        let report = download_missing(&store, "tl/images", local.path(), &options)
            .await
            .unwrap();

        assert_eq!(report.listed, 1);
        assert_eq!(report.downloaded, 1);
        assert_eq!(report.deleted, 1);
        assert!(local.path().join(A).exists());
        assert!(!local.path().join(C).exists());
        assert!(!local.path().join("2022-03-27").exists());
        assert!(local.path().join("2022-03-25/old/old.jpg").exists());
    }

    #[tokio::test]
    async fn test_configured_delete_extraneous_covers_every_day() {
        let remote = tempfile::tempdir().unwrap();
        let local = tempfile::tempdir().unwrap();
        write(remote.path(), &format!("tl/images/{A}"), b"a");
        write(local.path(), C, b"stale");
        write(local.path(), "2022-03-25/old/old.jpg", b"removed remotely");

        let mut config = TimelapseConfig::default();
        config.sync.delete_extraneous = true;
        let options = DownloadOptions::from_config(&config);
        assert!(options.day_prefix.is_none());

        let store = LocalBlobStore::new(remote.path());
        let report = download_missing(&store, "tl/images", local.path(), &options)
            .await
            .unwrap();

        assert_eq!(report.downloaded, 1);
        assert_eq!(report.deleted, 2);
        assert!(local.path().join(A).exists());
        assert!(!local.path().join(C).exists());
        assert!(!local.path().join("2022-03-25/old/old.jpg").exists());
    }
}
