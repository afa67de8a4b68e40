//! Blob storage abstraction.
//!
//! Keys are `/`-delimited, e.g.
//! `annolapse1/images/2022-03-26/2022-03-26T10-30-00/2022-03-26T10-30-00--shutter_100.jpg`.
//! The container (bucket) is fixed per store instance.

use crate::config::{ConfigurationError, StorageBackend, StorageConfig};
use crate::s3_store::S3BlobStore;
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument};
use walkdir::WalkDir;

const PARTIAL_SUFFIX: &str = ".partial";

/// Errors from blob transfers. All of them are recoverable: the caller keeps
/// its local copy and tries again later.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("blob {key} not found")]
    NotFound { key: String },

    #[error("storage request for {key} failed: {message}")]
    Request { key: String, message: String },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid blob key {0:?}")]
    InvalidKey(String),

    #[error("storage task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// A container of named byte blobs.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `data` under `key`, replacing any previous blob.
    async fn upload(&self, key: &str, data: Bytes) -> Result<(), TransferError>;

    /// All keys starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, TransferError>;

    async fn download(&self, key: &str) -> Result<Bytes, TransferError>;

    /// Remove `key`. Removing a missing blob is not an error.
    async fn delete(&self, key: &str) -> Result<(), TransferError>;

    /// Time-limited URL for direct access, if the store supports it.
    async fn presigned_url(
        &self,
        _key: &str,
        _expiry: Duration,
    ) -> Result<Option<String>, TransferError> {
        Ok(None)
    }

    /// Human readable location, used in logs.
    fn describe(&self) -> String;
}

/// Open the store selected by `storage.backend`.
pub async fn open_blob_store(
    config: &StorageConfig,
) -> Result<Arc<dyn BlobStore>, ConfigurationError> {
    match config.backend {
        StorageBackend::S3 => Ok(Arc::new(S3BlobStore::new(config).await?)),
        StorageBackend::Local => {
            let root = config.local_root.clone().ok_or_else(|| {
                crate::config::ConfigValidationError::MissingField("storage.local_root".to_string())
            })?;
            Ok(Arc::new(LocalBlobStore::new(root)))
        }
    }
}

/// A directory standing in for a container. Keys map to relative paths.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        info!(root = %root.display(), "Local blob store initialized");
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, TransferError> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && !key.ends_with(PARTIAL_SUFFIX)
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(TransferError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> TransferError + '_ {
    move |source| TransferError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    #[instrument(skip(self, data), fields(size_bytes = data.len()))]
    async fn upload(&self, key: &str, data: Bytes) -> Result<(), TransferError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(io_error(parent))?;
        }

        let mut partial = path.clone().into_os_string();
        partial.push(PARTIAL_SUFFIX);
        let partial = PathBuf::from(partial);

        tokio::fs::write(&partial, &data)
            .await
            .map_err(io_error(&partial))?;
        tokio::fs::rename(&partial, &path)
            .await
            .map_err(io_error(&path))?;

        debug!(key = %key, "Blob written");
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, TransferError> {
        let root = self.root.clone();
        let prefix = prefix.to_string();

        tokio::task::spawn_blocking(move || -> Result<Vec<String>, TransferError> {
            let mut keys = Vec::new();
            if !root.exists() {
                return Ok(keys);
            }
            for entry in WalkDir::new(&root).min_depth(1) {
                let entry = entry.map_err(|e| TransferError::Io {
                    path: e.path().map(Path::to_path_buf).unwrap_or_else(|| root.clone()),
                    source: e.into(),
                })?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let Ok(relative) = entry.path().strip_prefix(&root) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.starts_with(&prefix) && !key.ends_with(PARTIAL_SUFFIX) {
                    keys.push(key);
                }
            }
            keys.sort();
            Ok(keys)
        })
        .await?
    }

    async fn download(&self, key: &str) -> Result<Bytes, TransferError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(TransferError::NotFound {
                key: key.to_string(),
            }),
            Err(e) => Err(io_error(&path)(e)),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), TransferError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&path)(e)),
        }
    }

    fn describe(&self) -> String {
        format!("file://{}", self.root.display())
    }
}
