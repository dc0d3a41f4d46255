//! S3 object store for job artifacts.

use super::{sdk_error, DEFAULT_REGION};
use crate::error::{ReelWatchError, Result};
use crate::job::service::ObjectStore;
use async_trait::async_trait;
use aws_sdk_s3::error::ProvideErrorMetadata;
use aws_sdk_s3::types::{BucketLocationConstraint, CreateBucketConfiguration};
use aws_sdk_s3::Client;
use std::path::Path;

/// Artifact store backed by Amazon S3.
#[derive(Debug, Clone)]
pub struct S3ObjectStore {
    client: Client,
    region: String,
}

impl S3ObjectStore {
    /// Creates a store from a loaded SDK configuration.
    pub fn new(config: &aws_config::SdkConfig) -> Self {
        let region = config
            .region()
            .map(|r| r.to_string())
            .unwrap_or_else(|| DEFAULT_REGION.to_string());
        Self {
            client: Client::new(config),
            region,
        }
    }

    /// Creates the output bucket if it does not exist yet.
    ///
    /// Returns `true` when the bucket was created and `false` when it was
    /// already owned by the caller.
    pub async fn create_bucket(&self, bucket: &str) -> Result<bool> {
        let mut request = self.client.create_bucket().bucket(bucket);
        // us-east-1 rejects an explicit location constraint
        if self.region != DEFAULT_REGION {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(self.region.as_str()))
                    .build(),
            );
        }

        match request.send().await {
            Ok(_) => {
                tracing::info!(bucket, region = %self.region, "created output bucket");
                Ok(true)
            }
            Err(err) if err.code() == Some("BucketAlreadyOwnedByYou") => {
                tracing::debug!(bucket, "output bucket already exists");
                Ok(false)
            }
            Err(err) => Err(sdk_error("CreateBucket", err)),
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn list_keys(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let output = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| sdk_error("ListObjectsV2", e))?;

            keys.extend(
                output
                    .contents()
                    .iter()
                    .filter_map(|object| object.key())
                    .map(str::to_owned),
            );

            match output.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }

        Ok(keys)
    }

    async fn download(&self, bucket: &str, key: &str, dest: &Path) -> Result<u64> {
        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| sdk_error("GetObject", e))?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| ReelWatchError::Network(format!("reading s3://{bucket}/{key}: {e}")))?
            .into_bytes();

        // A crash mid-write must not leave a file that looks like a finished download.
        let partial = dest.with_extension("part");
        tokio::fs::write(&partial, &data).await?;
        tokio::fs::rename(&partial, dest).await?;

        tracing::debug!(bucket, key, bytes = data.len(), dest = %dest.display(), "downloaded object");
        Ok(data.len() as u64)
    }
}
