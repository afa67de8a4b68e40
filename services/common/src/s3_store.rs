use crate::blob_store::{BlobStore, TransferError};
use crate::config::{ConfigurationError, StorageConfig};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::timeout::TimeoutConfig;
use aws_sdk_s3::config::{Builder as S3ConfigBuilder, Credentials};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Blob store backed by an S3-compatible bucket. The configured container is
/// the bucket name.
pub struct S3BlobStore {
    client: S3Client,
    bucket: String,
}

impl S3BlobStore {
    /// Create a new store. Fails when no credential source is configured.
    pub async fn new(config: &StorageConfig) -> Result<Self, ConfigurationError> {
        config.check_credentials()?;

        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let timeouts = TimeoutConfig::builder()
            .operation_timeout(config.request_timeout())
            .build();

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config).timeout_config(timeouts);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        if let (Some(access_key_id), Some(secret_access_key)) =
            (&config.access_key_id, &config.secret_access_key)
        {
            s3_config_builder = s3_config_builder.credentials_provider(Credentials::new(
                access_key_id,
                secret_access_key,
                None,
                None,
                "timelapse-config",
            ));
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.container,
            region = %config.region,
            "S3 blob store initialized"
        );

        Ok(Self {
            client,
            bucket: config.container.clone(),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

fn request_error(key: &str, error: impl std::error::Error) -> TransferError {
    TransferError::Request {
        key: key.to_string(),
        message: DisplayErrorContext(error).to_string(),
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    #[instrument(skip(self, data), fields(bucket = %self.bucket, size_bytes = data.len()))]
    async fn upload(&self, key: &str, data: Bytes) -> Result<(), TransferError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type(key))
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| request_error(key, e))?;

        debug!(key = %key, "Blob uploaded");
        Ok(())
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn list(&self, prefix: &str) -> Result<Vec<String>, TransferError> {
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .into_paginator()
            .send();

        let mut keys = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| request_error(prefix, e))?;
            keys.extend(
                page.contents()
                    .iter()
                    .filter_map(|obj| obj.key().map(String::from)),
            );
        }
        keys.sort();

        debug!(prefix = %prefix, count = keys.len(), "Listed blobs");
        Ok(keys)
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn download(&self, key: &str) -> Result<Bytes, TransferError> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error()
                    .map(|e| e.is_no_such_key())
                    .unwrap_or(false)
                {
                    TransferError::NotFound {
                        key: key.to_string(),
                    }
                } else {
                    request_error(key, e)
                }
            })?;

        let body = output
            .body
            .collect()
            .await
            .map_err(|e| request_error(key, e))?;
        Ok(body.into_bytes())
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn delete(&self, key: &str) -> Result<(), TransferError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| request_error(key, e))?;

        debug!(key = %key, "Blob deleted");
        Ok(())
    }

    async fn presigned_url(
        &self,
        key: &str,
        expiry: Duration,
    ) -> Result<Option<String>, TransferError> {
        let presigning_config =
            PresigningConfig::expires_in(expiry).map_err(|e| request_error(key, e))?;

        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning_config)
            .await
            .map_err(|e| request_error(key, e))?;

        Ok(Some(presigned.uri().to_string()))
    }

    fn describe(&self) -> String {
        format!("s3://{}", self.bucket)
    }
}

/// Content type from the key's extension
fn content_type(key: &str) -> &'static str {
    let extension = key.rsplit_once('.').map(|(_, ext)| ext).unwrap_or_default();
    match extension.to_lowercase().as_str() {
        "jpeg" | "jpg" => "image/jpeg",
        "png" => "image/png",
        "bmp" => "image/bmp",
        "mp4" => "video/mp4",
        _ => "application/octet-stream",
    }
}
